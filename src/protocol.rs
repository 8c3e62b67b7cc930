//! Protocol definition loading and validation.
//!
//! A protocol is an ordered list of phases a project moves through, plus a
//! table of named check commands. Definitions are JSON files resolved from
//! a small search path and validated in full before anything runs: a
//! definition that cannot be found or does not hold together is a hard
//! error, never a partial result.
//!
//! Protocols are loaded fresh on every invocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::ProtocolError;

/// How a phase completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    /// The phase is done after a single pass of checks and gate approval.
    #[default]
    Once,
    /// The phase decomposes into plan phases pulled from the plan document;
    /// every plan phase must complete before the phase itself can.
    #[serde(alias = "phased")]
    PerPlanPhase,
}

/// A validated protocol definition.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub name: String,
    pub version: Option<String>,
    phases: Vec<ProtocolPhase>,
    /// Merged check-command table: `defaults.checks` overridden by each
    /// phase's inline entries.
    checks: BTreeMap<String, String>,
}

/// One phase of a protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolPhase {
    pub id: String,
    pub name: String,
    pub phase_type: PhaseType,
    pub gate: Option<String>,
    /// Declared check names, in declaration order.
    pub check_names: Vec<String>,
    /// Successor phase id; `None` means terminal.
    pub next: Option<String>,
}

impl ProtocolPhase {
    pub fn is_phased(&self) -> bool {
        self.phase_type == PhaseType::PerPlanPhase
    }
}

// Raw serde model for the on-disk format. Normalized into the validated
// types above before anyone else sees it.

#[derive(Deserialize)]
struct RawProtocol {
    name: String,
    version: Option<String>,
    #[serde(default)]
    defaults: RawDefaults,
    phases: Vec<RawPhase>,
}

#[derive(Default, Deserialize)]
struct RawDefaults {
    #[serde(default)]
    checks: BTreeMap<String, RawCheck>,
}

#[derive(Deserialize)]
struct RawPhase {
    #[serde(default)]
    id: String,
    name: Option<String>,
    #[serde(rename = "type", default)]
    phase_type: PhaseType,
    gate: Option<RawGate>,
    transition: Option<RawTransition>,
    #[serde(default)]
    checks: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawGate {
    name: String,
    next: Option<String>,
}

#[derive(Deserialize)]
struct RawTransition {
    on_complete: Option<String>,
}

/// A check entry: either a bare command string or an object with a
/// `command` field. An object without one defers to `defaults.checks`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCheck {
    Command(String),
    Object { command: Option<String> },
}

impl RawCheck {
    fn command(self) -> Option<String> {
        match self {
            RawCheck::Command(cmd) => Some(cmd),
            RawCheck::Object { command } => command,
        }
    }
}

impl Protocol {
    /// Resolve and load a protocol by name.
    ///
    /// For each base directory in order, tries `<name>.json` then
    /// `<name>/protocol.json`; the first existing file wins. No match
    /// anywhere is an error enumerating every path searched.
    pub fn load(dirs: &[PathBuf], name: &str) -> Result<Protocol, ProtocolError> {
        let mut searched = Vec::new();
        for dir in dirs {
            let candidates = [
                dir.join(format!("{name}.json")),
                dir.join(name).join("protocol.json"),
            ];
            for candidate in candidates {
                if candidate.is_file() {
                    return Self::load_file(&candidate);
                }
                searched.push(candidate);
            }
        }
        Err(ProtocolError::NotFound {
            name: name.to_string(),
            searched,
        })
    }

    /// Load and validate a protocol from a specific file.
    pub fn load_file(path: &Path) -> Result<Protocol, ProtocolError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProtocolError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawProtocol =
            serde_json::from_str(&content).map_err(|source| ProtocolError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawProtocol) -> Result<Protocol, ProtocolError> {
        let invalid = |message: String| ProtocolError::Invalid {
            name: raw.name.clone(),
            message,
        };

        if raw.phases.is_empty() {
            return Err(invalid("protocol declares no phases".into()));
        }

        let mut checks: BTreeMap<String, String> = raw
            .defaults
            .checks
            .into_iter()
            .filter_map(|(name, check)| check.command().map(|cmd| (name, cmd)))
            .collect();

        let mut phases = Vec::with_capacity(raw.phases.len());
        for (index, phase) in raw.phases.into_iter().enumerate() {
            if phase.id.trim().is_empty() {
                return Err(invalid(format!("phase at index {index} has no id")));
            }

            let mut check_names = Vec::with_capacity(phase.checks.len());
            for (check_name, value) in phase.checks {
                let check: RawCheck = serde_json::from_value(value).map_err(|e| {
                    invalid(format!(
                        "check '{}' in phase '{}' is malformed: {}",
                        check_name, phase.id, e
                    ))
                })?;
                if let Some(cmd) = check.command() {
                    checks.insert(check_name.clone(), cmd);
                }
                check_names.push(check_name);
            }

            // transition.on_complete wins over gate.next when both exist
            let next = phase
                .transition
                .as_ref()
                .and_then(|t| t.on_complete.clone())
                .or_else(|| phase.gate.as_ref().and_then(|g| g.next.clone()));

            phases.push(ProtocolPhase {
                name: phase.name.unwrap_or_else(|| phase.id.clone()),
                id: phase.id,
                phase_type: phase.phase_type,
                gate: phase.gate.map(|g| g.name),
                check_names,
                next,
            });
        }

        for phase in &phases {
            if let Some(dup) = phases.iter().filter(|p| p.id == phase.id).nth(1) {
                return Err(invalid(format!("duplicate phase id '{}'", dup.id)));
            }
            if let Some(ref next) = phase.next
                && !phases.iter().any(|p| &p.id == next)
            {
                return Err(invalid(format!(
                    "phase '{}' transitions to unknown phase '{}'",
                    phase.id, next
                )));
            }
            for check_name in &phase.check_names {
                if !checks.contains_key(check_name) {
                    return Err(invalid(format!(
                        "check '{}' declared by phase '{}' has no command (inline or in defaults.checks)",
                        check_name, phase.id
                    )));
                }
            }
        }

        Ok(Protocol {
            name: raw.name,
            version: raw.version,
            phases,
            checks,
        })
    }

    pub fn phases(&self) -> &[ProtocolPhase] {
        &self.phases
    }

    /// Look up a phase by id.
    pub fn phase(&self, id: &str) -> Option<&ProtocolPhase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// The phase a newly initialized project starts in.
    pub fn first_phase(&self) -> &ProtocolPhase {
        // Validated non-empty at load
        &self.phases[0]
    }

    /// The phase reachable through `phase.next`, if any.
    pub fn next_phase(&self, phase: &ProtocolPhase) -> Option<&ProtocolPhase> {
        phase.next.as_deref().and_then(|id| self.phase(id))
    }

    /// Concrete `(name, command)` pairs for a phase's declared checks, in
    /// declaration order. Resolvability was validated at load time.
    pub fn check_commands(&self, phase: &ProtocolPhase) -> Vec<(String, String)> {
        phase
            .check_names
            .iter()
            .filter_map(|name| {
                self.checks
                    .get(name)
                    .map(|cmd| (name.clone(), cmd.clone()))
            })
            .collect()
    }

    /// Every gate name declared by any phase, in phase order, deduplicated.
    pub fn gate_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for phase in &self.phases {
            if let Some(ref gate) = phase.gate
                && !names.contains(gate)
            {
                names.push(gate.clone());
            }
        }
        names
    }
}
