use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the cadence configuration directory.
pub const CADENCE_DIR: &str = ".cadence";

/// Default check timeout in seconds (5 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Runtime configuration for cadence.
///
/// Every path the orchestrator touches is resolved here, from an explicit
/// root directory. Nothing downstream consults the process working
/// directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// The project workspace root (where `.cadence/` lives).
    pub root: PathBuf,
    /// Directory holding one subdirectory per tracked project.
    pub projects_dir: PathBuf,
    /// Protocol definition search path, highest precedence first.
    pub protocol_dirs: Vec<PathBuf>,
    /// Timeout applied to each check command.
    pub check_timeout: Duration,
    pub verbose: bool,
}

/// Optional settings file at `.cadence/config.toml`.
#[derive(Debug, Default, Deserialize)]
struct Settings {
    #[serde(default)]
    checks: CheckSettings,
}

#[derive(Debug, Default, Deserialize)]
struct CheckSettings {
    timeout_secs: Option<u64>,
}

impl Config {
    /// Resolve configuration from the workspace root.
    ///
    /// Timeout precedence: `CADENCE_TIMEOUT_SECS` env var, then
    /// `.cadence/config.toml`, then the 5 minute default.
    pub fn new(root: PathBuf, verbose: bool) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve root directory: {}", root.display()))?;

        let cadence_dir = root.join(CADENCE_DIR);
        let settings = Self::load_settings(&cadence_dir.join("config.toml"))?;

        let timeout_secs = std::env::var("CADENCE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .or(settings.checks.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut protocol_dirs = vec![cadence_dir.join("protocols")];
        if let Some(user_dir) = dirs::config_dir() {
            protocol_dirs.push(user_dir.join("cadence").join("protocols"));
        }

        Ok(Self {
            root,
            projects_dir: cadence_dir.join("projects"),
            protocol_dirs,
            check_timeout: Duration::from_secs(timeout_secs),
            verbose,
        })
    }

    fn load_settings(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Directory holding a single project's state and plan document.
    pub fn project_dir(&self, id: &str, title: &str) -> PathBuf {
        self.projects_dir.join(format!("{}-{}", id, slugify(title)))
    }
}

/// Lowercase a title and collapse whitespace runs into single dashes so it
/// is safe as a path component.
pub fn slugify(title: &str) -> String {
    title
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
