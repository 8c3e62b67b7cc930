//! Project initialization command.

use anyhow::Result;
use cadence::config::Config;
use cadence::orchestrator::Orchestrator;
use cadence::state::PLAN_FILE;

pub fn cmd_init(config: &Config, protocol: &str, id: &str, title: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());
    let report = orchestrator.init(protocol, id, title)?;

    println!();
    println!(
        "Initialized project {} ({}) under protocol '{}'",
        report.state.id, report.state.title, report.state.protocol
    );
    println!("State: {}", report.project_dir.join("status.json").display());
    println!();
    println!("Starting phase: {}", report.state.phase);
    if !report.state.gates.is_empty() {
        println!(
            "Gates: {}",
            report
                .state
                .gates
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    println!(
        "Plan document (for plan-driven phases): {}",
        report.project_dir.join(PLAN_FILE).display()
    );
    println!();
    println!("Next: cadence status {}", report.state.id);
    println!();
    Ok(())
}
