use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cadence::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Protocol orchestrator - phase-gated engineering workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace root holding the .cadence directory. Defaults to the
    /// current directory.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new project under a protocol
    Init {
        /// Protocol name to resolve from the protocol search path
        protocol: String,
        /// Project id (used as the directory-name prefix)
        id: String,
        /// Project title
        title: String,
    },
    /// Show the current phase and the next command to run
    Status { id: String },
    /// Run the current phase's checks without mutating state
    Check { id: String },
    /// Record the current unit of work as done and advance when every
    /// invariant holds
    Done { id: String },
    /// Request human approval of the current phase's gate
    Gate { id: String },
    /// Approve a named gate (human supervisors)
    Approve { id: String, gate: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = match cli.root.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(root, cli.verbose)?;

    match &cli.command {
        Commands::Init {
            protocol,
            id,
            title,
        } => cmd::cmd_init(&config, protocol, id, title)?,
        Commands::Status { id } => cmd::cmd_status(&config, id)?,
        Commands::Check { id } => cmd::cmd_check(&config, id).await?,
        Commands::Done { id } => cmd::cmd_done(&config, id).await?,
        Commands::Gate { id } => cmd::cmd_gate(&config, id)?,
        Commands::Approve { id, gate } => cmd::cmd_approve(&config, id, gate)?,
    }

    Ok(())
}
