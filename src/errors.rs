//! Typed error hierarchy for the cadence orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `ProtocolError` — protocol definition loading and validation failures
//! - `StateError` — project state persistence failures
//! - `OrchestratorError` — command-surface failures (blocked gates, failing
//!   checks, re-init of an existing project)
//!
//! Every variant carries the offending identifier and, where it helps the
//! caller recover, the list of valid alternatives.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading a protocol definition.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol '{name}' not found. Searched:\n{}", format_paths(searched))]
    NotFound { name: String, searched: Vec<PathBuf> },

    #[error("Failed to read protocol definition at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse protocol definition at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid protocol '{name}': {message}")]
    Invalid { name: String, message: String },
}

/// Errors from reading or writing project state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Project '{id}' not found. Run 'cadence init <protocol> {id} <title>' to create it")]
    ProjectNotFound { id: String },

    #[error("Project id '{id}' matches multiple directories:\n{}", format_paths(matches))]
    AmbiguousProject { id: String, matches: Vec<PathBuf> },

    #[error("Failed to parse project state at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Project state at {path} is missing required fields: {}", fields.join(", "))]
    MissingFields { path: PathBuf, fields: Vec<String> },

    #[error(
        "Project state at {path} changed on disk since it was read; \
         re-run the command to pick up the new state"
    )]
    ConcurrentModification { path: PathBuf },

    #[error("Failed to write project state at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the orchestrator command surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Checks failed for phase '{phase}': {failed}")]
    ChecksFailed { phase: String, failed: String },

    #[error(
        "Gate '{gate}' has not been approved. \
         Run 'cadence gate {id}' to request approval"
    )]
    GateBlocked { id: String, gate: String },

    #[error("Unknown gate '{gate}' for project '{id}'. Known gates: {}", known.join(", "))]
    UnknownGate {
        id: String,
        gate: String,
        known: Vec<String>,
    },

    #[error("State references phase '{phase}' which does not exist in protocol '{protocol}'")]
    UnknownPhase { phase: String, protocol: String },

    #[error("Project '{id}' already exists at {path}")]
    AlreadyExists { id: String, path: PathBuf },

    #[error(
        "Phase '{phase}' is plan-driven but no plan document exists at {path}. \
         Write the plan before running 'done'"
    )]
    PlanMissing { phase: String, path: PathBuf },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}
