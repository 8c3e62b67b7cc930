//! Project state persistence.
//!
//! One project owns one directory under the projects root, named
//! `<id>-<slug>`, holding `status.json` (the persisted state record) and
//! `plan.md` (the plan document). The state record is the sole unit of
//! mutable truth for a project: created once by `init`, mutated only by
//! the orchestrator, never deleted here.
//!
//! Writes are atomic (tmp file in the same directory, then rename) and
//! guarded by an optimistic check: when the on-disk record advanced past
//! the copy a command read, the write is refused instead of silently
//! losing the other writer's update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::StateError;
use crate::plan::{self, PlanPhase};
use crate::protocol::Protocol;

/// Filename of the state record inside a project directory.
pub const STATE_FILE: &str = "status.json";

/// Filename of the plan document inside a project directory.
pub const PLAN_FILE: &str = "plan.md";

/// Approval state of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Pending,
    Approved,
}

/// A named human-approval checkpoint. Once approved, never reverts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateStatus {
    pub status: GateState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

impl GateStatus {
    pub fn pending() -> Self {
        Self {
            status: GateState::Pending,
            requested_at: None,
            approved_at: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == GateState::Approved
    }
}

/// The persisted record of one project's progress through a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: String,
    pub title: String,
    pub protocol: String,
    /// Current protocol phase id.
    pub phase: String,
    #[serde(default)]
    pub plan_phases: Vec<PlanPhase>,
    /// Id of the first non-complete plan phase, or null.
    pub current_plan_phase: Option<String>,
    #[serde(default)]
    pub gates: BTreeMap<String, GateStatus>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    /// The state a freshly initialized project starts in: the protocol's
    /// first phase, no plan phases, and every declared gate pending.
    pub fn initial(protocol: &Protocol, id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            protocol: protocol.name.clone(),
            phase: protocol.first_phase().id.clone(),
            plan_phases: Vec::new(),
            current_plan_phase: None,
            gates: protocol
                .gate_names()
                .into_iter()
                .map(|name| (name, GateStatus::pending()))
                .collect(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Re-derive `current_plan_phase` from the plan-phase list.
    pub fn refresh_current_plan_phase(&mut self) {
        self.current_plan_phase =
            plan::current_plan_phase(&self.plan_phases).map(|p| p.id.clone());
    }
}

/// Reads and writes project state under a fixed projects directory.
pub struct StateStore {
    projects_dir: PathBuf,
}

impl StateStore {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self { projects_dir }
    }

    /// Discover a project directory by id prefix.
    ///
    /// Scans the projects directory once for names beginning `<id>-`.
    /// Zero matches is "not found"; multiple matches are surfaced, never
    /// guessed between.
    pub fn find_project(&self, id: &str) -> Result<PathBuf, StateError> {
        let prefix = format!("{id}-");
        let not_found = || StateError::ProjectNotFound { id: id.to_string() };

        let entries = std::fs::read_dir(&self.projects_dir).map_err(|_| not_found())?;
        let mut matches: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        matches.sort();

        match matches.len() {
            0 => Err(not_found()),
            1 => Ok(matches.remove(0)),
            _ => Err(StateError::AmbiguousProject {
                id: id.to_string(),
                matches,
            }),
        }
    }

    /// Read the state record from a project directory.
    pub fn read(&self, project_dir: &Path) -> Result<ProjectState, StateError> {
        let path = project_dir.join(STATE_FILE);
        let content = std::fs::read_to_string(&path).map_err(|_| {
            // Derive the id from the directory name for the message
            let id = project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            StateError::ProjectNotFound {
                id: id.split('-').next().unwrap_or(&id).to_string(),
            }
        })?;

        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| StateError::Parse {
                path: path.clone(),
                source,
            })?;

        let missing: Vec<String> = ["id", "protocol", "phase"]
            .into_iter()
            .filter(|field| value.get(field).is_none_or(|v| v.is_null()))
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(StateError::MissingFields {
                path,
                fields: missing,
            });
        }

        serde_json::from_value(value).map_err(|source| StateError::Parse { path, source })
    }

    /// Persist the state record atomically.
    ///
    /// Refuses when the on-disk record was updated after this one was
    /// read, then stamps `updated_at` strictly later than the prior value,
    /// writes a tmp file in the same directory and renames it over the
    /// destination.
    pub fn write(&self, project_dir: &Path, state: &mut ProjectState) -> Result<(), StateError> {
        let path = project_dir.join(STATE_FILE);

        if path.exists()
            && let Ok(on_disk) = self.read(project_dir)
            && on_disk.updated_at > state.updated_at
        {
            return Err(StateError::ConcurrentModification { path });
        }

        let now = Utc::now();
        state.updated_at = if now > state.updated_at {
            now
        } else {
            state.updated_at + chrono::Duration::milliseconds(1)
        };

        let write_err = |source: std::io::Error| StateError::Write {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| write_err(std::io::Error::other(e)))?;
        let tmp = project_dir.join(format!(".{STATE_FILE}.tmp"));
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(())
    }

    /// Path of the plan document inside a project directory.
    pub fn plan_path(project_dir: &Path) -> PathBuf {
        project_dir.join(PLAN_FILE)
    }

    /// Path of the state record inside a project directory.
    pub fn state_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_FILE)
    }
}
