//! The orchestrator engine: the state machine behind the command surface.
//!
//! States are protocol phase ids; transitions are each phase's `next`.
//! A plan-driven phase carries a nested sub-machine over its plan phases
//! that must fully resolve before the phase itself can complete. Gates
//! guard the top-level transition: until a declared gate is approved, no
//! amount of insistence moves the phase forward.
//!
//! Every command either fully succeeds (at most one state write) or fails
//! before any write. Check failures are data, not errors — `done` and
//! `check` need all results to display, so the engine reports them in the
//! outcome and the command layer turns an overall failure into the exit
//! code.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::checks::{
    self, CheckResult, ENV_PROJECT_ID, ENV_PROJECT_TITLE, all_checks_passed, first_failure,
};
use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::plan::{self, PlanPhase, PlanPhaseStatus};
use crate::protocol::{Protocol, ProtocolPhase};
use crate::state::{ProjectState, StateStore};

type OrcResult<T> = Result<T, OrchestratorError>;

/// Snapshot of the current protocol phase for reports.
#[derive(Debug, Clone)]
pub struct PhaseInfo {
    pub id: String,
    pub name: String,
    pub phased: bool,
    pub gate: Option<String>,
    pub terminal: bool,
}

impl PhaseInfo {
    fn of(phase: &ProtocolPhase) -> Self {
        Self {
            id: phase.id.clone(),
            name: phase.name.clone(),
            phased: phase.is_phased(),
            gate: phase.gate.clone(),
            terminal: phase.next.is_none(),
        }
    }
}

/// Sub-phase progress of a plan-driven phase.
#[derive(Debug, Clone)]
pub struct PlanProgress {
    pub phases: Vec<PlanPhase>,
    pub current: Option<PlanPhase>,
    /// Prose of the current plan phase, when the plan document has it.
    pub content: Option<String>,
}

/// What `status` found.
#[derive(Debug)]
pub enum StatusReport {
    /// A gate was requested and not yet approved: hard stop.
    WaitingForApproval {
        id: String,
        gate: String,
        requested_at: Option<DateTime<Utc>>,
        phase: PhaseInfo,
    },
    Active {
        id: String,
        title: String,
        protocol: String,
        phase: PhaseInfo,
        plan: Option<PlanProgress>,
        /// Declared check names for the phase.
        checks: Vec<String>,
        instructions: Vec<String>,
        next_command: String,
    },
}

/// What `done` decided, alongside every check result it produced.
#[derive(Debug)]
pub struct DoneReport {
    pub results: Vec<CheckResult>,
    pub outcome: DoneOutcome,
}

#[derive(Debug)]
pub enum DoneOutcome {
    /// A check failed; nothing was written.
    ChecksFailed { phase: String, failed: String },
    /// Checks passed but the phase's gate is not approved.
    GateBlocked { gate: String },
    /// Only the plan-phase sub-machine advanced.
    PlanPhaseAdvanced {
        completed: PlanPhase,
        next: Option<PlanPhase>,
    },
    /// The top-level phase transitioned.
    PhaseAdvanced {
        from: String,
        to: String,
        /// Number of plan phases derived when the new phase is plan-driven.
        entered_plan_phases: Option<usize>,
    },
    /// The current phase is terminal; the protocol is complete.
    ProtocolComplete { phase: String },
}

/// What `gate` decided.
#[derive(Debug)]
pub enum GateReport {
    /// The current phase declares no gate.
    NoGate { phase: String },
    AlreadyApproved {
        gate: String,
        approved_at: Option<DateTime<Utc>>,
    },
    /// The gate is pending; `requested_at` stamped on the first call only.
    Requested {
        gate: String,
        requested_at: DateTime<Utc>,
        first_request: bool,
    },
}

/// What `approve` decided.
#[derive(Debug)]
pub enum ApproveReport {
    /// No-op: the gate was already approved; the original stamp stands.
    AlreadyApproved {
        gate: String,
        approved_at: Option<DateTime<Utc>>,
    },
    Approved {
        gate: String,
        approved_at: DateTime<Utc>,
    },
}

/// What `init` produced.
#[derive(Debug)]
pub struct InitReport {
    pub project_dir: PathBuf,
    pub state: ProjectState,
}

pub struct Orchestrator {
    config: Config,
    store: StateStore,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let store = StateStore::new(config.projects_dir.clone());
        Self { config, store }
    }

    /// Create and persist the initial state for a new project.
    pub fn init(&self, protocol_name: &str, id: &str, title: &str) -> OrcResult<InitReport> {
        let protocol = Protocol::load(&self.config.protocol_dirs, protocol_name)?;
        let project_dir = self.config.project_dir(id, title);

        if StateStore::state_path(&project_dir).exists() {
            return Err(OrchestratorError::AlreadyExists {
                id: id.to_string(),
                path: project_dir,
            });
        }

        std::fs::create_dir_all(&project_dir).with_context(|| {
            format!("Failed to create project directory: {}", project_dir.display())
        })?;

        let mut state = ProjectState::initial(&protocol, id, title);
        self.store.write(&project_dir, &mut state)?;

        Ok(InitReport { project_dir, state })
    }

    /// Report the current phase, plan progress and the next command.
    pub fn status(&self, id: &str) -> OrcResult<StatusReport> {
        let (project_dir, state, protocol) = self.load_project(id)?;
        let phase = current_phase(&protocol, &state)?;
        let info = PhaseInfo::of(phase);

        // A requested, unapproved gate is a hard stop: a human must act
        if let Some(gate_name) = &phase.gate
            && let Some(gate) = state.gates.get(gate_name)
            && !gate.is_approved()
            && gate.requested_at.is_some()
        {
            return Ok(StatusReport::WaitingForApproval {
                id: state.id.clone(),
                gate: gate_name.clone(),
                requested_at: gate.requested_at,
                phase: info,
            });
        }

        let plan = if phase.is_phased() {
            Some(self.plan_progress(&project_dir, &state))
        } else {
            None
        };

        let checks: Vec<String> = phase.check_names.clone();
        let instructions = build_instructions(&state, &info, plan.as_ref(), &checks);

        Ok(StatusReport::Active {
            id: state.id.clone(),
            title: state.title.clone(),
            protocol: state.protocol.clone(),
            phase: info,
            plan,
            checks,
            instructions,
            next_command: format!("cadence done {}", state.id),
        })
    }

    /// Run the current phase's checks. Never mutates persisted state.
    pub async fn check(&self, id: &str) -> OrcResult<Vec<CheckResult>> {
        let (_project_dir, state, protocol) = self.load_project(id)?;
        let phase = current_phase(&protocol, &state)?;
        let commands = protocol.check_commands(phase);
        let results = checks::run_phase_checks(
            &commands,
            &self.config.root,
            &project_env(&state),
            self.config.check_timeout,
        )
        .await?;
        Ok(results)
    }

    /// Advance the state machine: re-run checks, then the plan-phase
    /// sub-machine, then the gate, then the phase transition.
    pub async fn done(&self, id: &str) -> OrcResult<DoneReport> {
        let (project_dir, mut state, protocol) = self.load_project(id)?;
        let phase = current_phase(&protocol, &state)?.clone();

        let commands = protocol.check_commands(&phase);
        let results = checks::run_phase_checks(
            &commands,
            &self.config.root,
            &project_env(&state),
            self.config.check_timeout,
        )
        .await?;

        if !all_checks_passed(&results) {
            let failed = first_failure(&results)
                .map(|r| r.name.clone())
                .unwrap_or_default();
            return Ok(DoneReport {
                results,
                outcome: DoneOutcome::ChecksFailed {
                    phase: phase.id.clone(),
                    failed,
                },
            });
        }

        // Plan-driven phases drain their sub-machine before anything else
        if phase.is_phased() {
            if state.plan_phases.is_empty() {
                state.plan_phases = self.derive_plan_phases(&project_dir, &phase.id)?;
            }
            if !plan::all_plan_phases_complete(&state.plan_phases) {
                return self.advance_plan(project_dir, state, results);
            }
        }

        if let Some(gate_name) = &phase.gate {
            let approved = state
                .gates
                .get(gate_name)
                .map(|g| g.is_approved())
                .unwrap_or(false);
            if !approved {
                return Ok(DoneReport {
                    results,
                    outcome: DoneOutcome::GateBlocked {
                        gate: gate_name.clone(),
                    },
                });
            }
        }

        let Some(next) = protocol.next_phase(&phase) else {
            return Ok(DoneReport {
                results,
                outcome: DoneOutcome::ProtocolComplete {
                    phase: phase.id.clone(),
                },
            });
        };

        let entered_plan_phases = if next.is_phased() {
            let phases = self.derive_plan_phases(&project_dir, &next.id)?;
            let count = phases.len();
            state.plan_phases = phases;
            Some(count)
        } else {
            None
        };

        state.phase = next.id.clone();
        state.refresh_current_plan_phase();
        self.store.write(&project_dir, &mut state)?;

        Ok(DoneReport {
            results,
            outcome: DoneOutcome::PhaseAdvanced {
                from: phase.id.clone(),
                to: next.id.clone(),
                entered_plan_phases,
            },
        })
    }

    /// Request human approval of the current phase's gate.
    pub fn gate(&self, id: &str) -> OrcResult<GateReport> {
        let (project_dir, mut state, protocol) = self.load_project(id)?;
        let phase = current_phase(&protocol, &state)?;

        let Some(gate_name) = phase.gate.clone() else {
            return Ok(GateReport::NoGate {
                phase: phase.id.clone(),
            });
        };

        let known: Vec<String> = state.gates.keys().cloned().collect();
        let gate = state
            .gates
            .get_mut(&gate_name)
            .ok_or_else(|| OrchestratorError::UnknownGate {
                id: id.to_string(),
                gate: gate_name.clone(),
                known,
            })?;

        if gate.is_approved() {
            return Ok(GateReport::AlreadyApproved {
                gate: gate_name,
                approved_at: gate.approved_at,
            });
        }

        // Stamp once; later calls report the original request time
        match gate.requested_at {
            Some(requested_at) => Ok(GateReport::Requested {
                gate: gate_name,
                requested_at,
                first_request: false,
            }),
            None => {
                let now = Utc::now();
                gate.requested_at = Some(now);
                self.store.write(&project_dir, &mut state)?;
                Ok(GateReport::Requested {
                    gate: gate_name,
                    requested_at: now,
                    first_request: true,
                })
            }
        }
    }

    /// Approve a named gate. Idempotent: a second approval is a no-op.
    pub fn approve(&self, id: &str, gate_name: &str) -> OrcResult<ApproveReport> {
        let (project_dir, mut state, _protocol) = self.load_project(id)?;

        let known: Vec<String> = state.gates.keys().cloned().collect();
        let gate = state
            .gates
            .get_mut(gate_name)
            .ok_or_else(|| OrchestratorError::UnknownGate {
                id: id.to_string(),
                gate: gate_name.to_string(),
                known,
            })?;

        if gate.is_approved() {
            return Ok(ApproveReport::AlreadyApproved {
                gate: gate_name.to_string(),
                approved_at: gate.approved_at,
            });
        }

        let now = Utc::now();
        gate.status = crate::state::GateState::Approved;
        gate.approved_at = Some(now);
        self.store.write(&project_dir, &mut state)?;

        Ok(ApproveReport::Approved {
            gate: gate_name.to_string(),
            approved_at: now,
        })
    }

    fn load_project(&self, id: &str) -> OrcResult<(PathBuf, ProjectState, Protocol)> {
        let project_dir = self.store.find_project(id)?;
        let state = self.store.read(&project_dir)?;
        let protocol = Protocol::load(&self.config.protocol_dirs, &state.protocol)?;
        if protocol.phase(&state.phase).is_none() {
            return Err(OrchestratorError::UnknownPhase {
                phase: state.phase.clone(),
                protocol: state.protocol.clone(),
            });
        }
        Ok((project_dir, state, protocol))
    }

    /// Derive the plan-phase list for a plan-driven phase, first one
    /// in-progress. Loud failure when the plan document is missing.
    fn derive_plan_phases(&self, project_dir: &Path, phase_id: &str) -> OrcResult<Vec<PlanPhase>> {
        let plan_path = StateStore::plan_path(project_dir);
        if !plan_path.exists() {
            return Err(OrchestratorError::PlanMissing {
                phase: phase_id.to_string(),
                path: plan_path,
            });
        }
        let mut phases = plan::extract_phases_from_file(&plan_path)?;
        if let Some(first) = phases.first_mut() {
            first.status = PlanPhaseStatus::InProgress;
        }
        Ok(phases)
    }

    fn advance_plan(
        &self,
        project_dir: PathBuf,
        mut state: ProjectState,
        results: Vec<CheckResult>,
    ) -> OrcResult<DoneReport> {
        state.refresh_current_plan_phase();
        let current = state
            .current_plan_phase
            .clone()
            .and_then(|id| state.plan_phases.iter().find(|p| p.id == id).cloned())
            .context("Plan-phase sub-machine has no current phase")?;

        plan::advance_plan_phase(&mut state.plan_phases, &current.id);
        state.refresh_current_plan_phase();
        let next = state
            .current_plan_phase
            .clone()
            .and_then(|id| state.plan_phases.iter().find(|p| p.id == id).cloned());

        self.store.write(&project_dir, &mut state)?;

        Ok(DoneReport {
            results,
            outcome: DoneOutcome::PlanPhaseAdvanced {
                completed: current,
                next,
            },
        })
    }

    /// Plan progress for display. Falls back to a preview derived from the
    /// plan document when the persisted list is still empty.
    fn plan_progress(&self, project_dir: &Path, state: &ProjectState) -> PlanProgress {
        let plan_path = StateStore::plan_path(project_dir);
        let plan_text = std::fs::read_to_string(&plan_path).ok();

        let phases = if state.plan_phases.is_empty() {
            plan_text
                .as_deref()
                .map(plan::extract_plan_phases)
                .unwrap_or_default()
        } else {
            state.plan_phases.clone()
        };

        let current = plan::current_plan_phase(&phases).cloned();
        let content = match (&plan_text, &current) {
            (Some(text), Some(current)) => plan::phase_content(text, &current.id),
            _ => None,
        };

        PlanProgress {
            phases,
            current,
            content,
        }
    }
}

fn current_phase<'a>(
    protocol: &'a Protocol,
    state: &ProjectState,
) -> OrcResult<&'a ProtocolPhase> {
    protocol
        .phase(&state.phase)
        .ok_or_else(|| OrchestratorError::UnknownPhase {
            phase: state.phase.clone(),
            protocol: state.protocol.clone(),
        })
}

fn project_env(state: &ProjectState) -> Vec<(String, String)> {
    vec![
        (ENV_PROJECT_ID.to_string(), state.id.clone()),
        (ENV_PROJECT_TITLE.to_string(), state.title.clone()),
    ]
}

/// Phase-specific guidance: what to work on, what must pass, what blocks.
fn build_instructions(
    state: &ProjectState,
    phase: &PhaseInfo,
    plan: Option<&PlanProgress>,
    checks: &[String],
) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(plan) = plan {
        match &plan.current {
            Some(current) => {
                lines.push(format!(
                    "Work on plan phase '{}': {}",
                    current.id, current.title
                ));
            }
            None if plan.phases.is_empty() => {
                lines.push(format!(
                    "This phase is plan-driven but no plan document exists yet. \
                     Write {} before running 'cadence done {}'",
                    crate::state::PLAN_FILE,
                    state.id
                ));
            }
            None => {
                lines.push("All plan phases are complete.".to_string());
            }
        }
    } else {
        lines.push(format!("Complete the work for phase '{}'.", phase.name));
    }

    if !checks.is_empty() {
        lines.push(format!(
            "Checks that must pass: {} (try them with 'cadence check {}')",
            checks.join(", "),
            state.id
        ));
    }

    if let Some(gate) = &phase.gate
        && state.gates.get(gate).is_none_or(|g| !g.is_approved())
    {
        lines.push(format!(
            "Advancing past this phase requires approval of gate '{gate}'."
        ));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GateState;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const PROTOCOL: &str = r#"{
        "name": "spider",
        "phases": [
            {
                "id": "specify",
                "name": "Write the spec",
                "checks": {"lint_spec": "true"},
                "gate": {"name": "spec_review", "next": "implement"}
            },
            {
                "id": "implement",
                "type": "phased",
                "checks": {"build": "true"},
                "transition": {"on_complete": "review"}
            },
            {
                "id": "review",
                "gate": {"name": "final_review"}
            }
        ]
    }"#;

    const PLAN: &str = "## Phases\n### Phase 1: Core types\n### Phase 2: State mgmt\n";

    fn setup() -> (Orchestrator, TempDir) {
        let dir = tempdir().unwrap();
        let protocols = dir.path().join(".cadence/protocols");
        fs::create_dir_all(&protocols).unwrap();
        fs::write(protocols.join("spider.json"), PROTOCOL).unwrap();

        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        (Orchestrator::new(config), dir)
    }

    fn setup_with_project() -> (Orchestrator, TempDir, PathBuf) {
        let (orc, dir) = setup();
        let report = orc.init("spider", "0074", "test-feature").unwrap();
        fs::write(report.project_dir.join("plan.md"), PLAN).unwrap();
        (orc, dir, report.project_dir)
    }

    fn read_state(orc: &Orchestrator, id: &str) -> ProjectState {
        let project_dir = orc.store.find_project(id).unwrap();
        orc.store.read(&project_dir).unwrap()
    }

    fn approve_all(orc: &Orchestrator, id: &str, gates: &[&str]) {
        for gate in gates {
            orc.approve(id, gate).unwrap();
        }
    }

    #[test]
    fn test_init_starts_at_first_phase_with_pending_gates() {
        let (orc, _dir) = setup();
        let report = orc.init("spider", "0074", "test-feature").unwrap();

        assert_eq!(report.state.phase, "specify");
        assert_eq!(report.state.gates.len(), 2);
        assert!(report.state.gates.values().all(|g| !g.is_approved()));
        assert!(report.project_dir.join("status.json").exists());
    }

    #[test]
    fn test_init_twice_is_already_exists() {
        let (orc, _dir) = setup();
        orc.init("spider", "0074", "test-feature").unwrap();
        let err = orc.init("spider", "0074", "test-feature").unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists { .. }));
    }

    #[test]
    fn test_init_unknown_protocol_fails_before_any_write() {
        let (orc, dir) = setup();
        let err = orc.init("ghost", "0074", "test-feature").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Protocol(crate::errors::ProtocolError::NotFound { .. })
        ));
        assert!(!dir.path().join(".cadence/projects/0074-test-feature").exists());
    }

    #[test]
    fn test_status_reports_phase_and_next_command() {
        let (orc, _dir, _project) = setup_with_project();
        match orc.status("0074").unwrap() {
            StatusReport::Active {
                phase,
                next_command,
                checks,
                ..
            } => {
                assert_eq!(phase.id, "specify");
                assert_eq!(phase.name, "Write the spec");
                assert_eq!(next_command, "cadence done 0074");
                assert_eq!(checks, vec!["lint_spec"]);
            }
            other => panic!("Expected Active, got {other:?}"),
        }
    }

    #[test]
    fn test_status_waits_after_gate_requested() {
        let (orc, _dir, _project) = setup_with_project();
        orc.gate("0074").unwrap();
        match orc.status("0074").unwrap() {
            StatusReport::WaitingForApproval { gate, .. } => {
                assert_eq!(gate, "spec_review");
            }
            other => panic!("Expected WaitingForApproval, got {other:?}"),
        }
    }

    #[test]
    fn test_status_active_again_after_approval() {
        let (orc, _dir, _project) = setup_with_project();
        orc.gate("0074").unwrap();
        orc.approve("0074", "spec_review").unwrap();
        assert!(matches!(
            orc.status("0074").unwrap(),
            StatusReport::Active { .. }
        ));
    }

    #[tokio::test]
    async fn test_check_never_mutates_state() {
        let (orc, _dir, project) = setup_with_project();
        let before = fs::read_to_string(project.join("status.json")).unwrap();
        let results = orc.check("0074").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        let after = fs::read_to_string(project.join("status.json")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_done_refuses_on_failing_check() {
        let (orc, dir, project) = setup_with_project();
        // Swap the protocol's check for a failing one
        let failing = PROTOCOL.replace(r#""lint_spec": "true""#, r#""lint_spec": "false""#);
        fs::write(
            dir.path().join(".cadence/protocols/spider.json"),
            failing,
        )
        .unwrap();

        let before = fs::read_to_string(project.join("status.json")).unwrap();
        let report = orc.done("0074").await.unwrap();

        assert!(matches!(
            report.outcome,
            DoneOutcome::ChecksFailed { ref failed, .. } if failed == "lint_spec"
        ));
        // The load-bearing invariant: nothing was written
        let after = fs::read_to_string(project.join("status.json")).unwrap();
        assert_eq!(before, after);
        assert_eq!(read_state(&orc, "0074").phase, "specify");
    }

    #[tokio::test]
    async fn test_done_blocked_by_unapproved_gate() {
        let (orc, _dir, _project) = setup_with_project();
        let report = orc.done("0074").await.unwrap();
        assert!(matches!(
            report.outcome,
            DoneOutcome::GateBlocked { ref gate } if gate == "spec_review"
        ));
        assert_eq!(read_state(&orc, "0074").phase, "specify");
    }

    #[tokio::test]
    async fn test_done_advances_after_approval_and_enters_phased_phase() {
        let (orc, _dir, _project) = setup_with_project();
        approve_all(&orc, "0074", &["spec_review"]);

        let report = orc.done("0074").await.unwrap();
        match report.outcome {
            DoneOutcome::PhaseAdvanced {
                from,
                to,
                entered_plan_phases,
            } => {
                assert_eq!(from, "specify");
                assert_eq!(to, "implement");
                assert_eq!(entered_plan_phases, Some(2));
            }
            other => panic!("Expected PhaseAdvanced, got {other:?}"),
        }

        let state = read_state(&orc, "0074");
        assert_eq!(state.phase, "implement");
        assert_eq!(state.plan_phases.len(), 2);
        assert_eq!(state.plan_phases[0].status, PlanPhaseStatus::InProgress);
        assert_eq!(state.plan_phases[1].status, PlanPhaseStatus::Pending);
        assert_eq!(state.current_plan_phase.as_deref(), Some("phase_1"));
    }

    #[tokio::test]
    async fn test_done_refuses_to_enter_phased_phase_without_plan() {
        let (orc, _dir, project) = setup_with_project();
        fs::remove_file(project.join("plan.md")).unwrap();
        approve_all(&orc, "0074", &["spec_review"]);

        let err = orc.done("0074").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanMissing { .. }));
        // Failed before any write
        assert_eq!(read_state(&orc, "0074").phase, "specify");
    }

    #[tokio::test]
    async fn test_done_advances_plan_sub_machine_without_touching_phase() {
        let (orc, _dir, _project) = setup_with_project();
        approve_all(&orc, "0074", &["spec_review"]);
        orc.done("0074").await.unwrap(); // specify -> implement

        let report = orc.done("0074").await.unwrap();
        match report.outcome {
            DoneOutcome::PlanPhaseAdvanced { completed, next } => {
                assert_eq!(completed.id, "phase_1");
                assert_eq!(next.unwrap().id, "phase_2");
            }
            other => panic!("Expected PlanPhaseAdvanced, got {other:?}"),
        }

        let state = read_state(&orc, "0074");
        assert_eq!(state.phase, "implement");
        assert_eq!(state.plan_phases[0].status, PlanPhaseStatus::Complete);
        assert_eq!(state.plan_phases[1].status, PlanPhaseStatus::InProgress);
        assert_eq!(state.current_plan_phase.as_deref(), Some("phase_2"));
    }

    #[tokio::test]
    async fn test_done_transitions_only_after_all_plan_phases_complete() {
        let (orc, _dir, _project) = setup_with_project();
        approve_all(&orc, "0074", &["spec_review"]);
        orc.done("0074").await.unwrap(); // -> implement
        orc.done("0074").await.unwrap(); // phase_1 complete
        orc.done("0074").await.unwrap(); // phase_2 complete

        let report = orc.done("0074").await.unwrap();
        assert!(matches!(
            report.outcome,
            DoneOutcome::PhaseAdvanced { ref to, .. } if to == "review"
        ));
        let state = read_state(&orc, "0074");
        assert_eq!(state.phase, "review");
        assert!(state.current_plan_phase.is_none());
    }

    #[tokio::test]
    async fn test_done_on_terminal_phase_reports_complete() {
        let (orc, _dir, _project) = setup_with_project();
        approve_all(&orc, "0074", &["spec_review", "final_review"]);
        orc.done("0074").await.unwrap(); // -> implement
        orc.done("0074").await.unwrap();
        orc.done("0074").await.unwrap();
        orc.done("0074").await.unwrap(); // -> review

        let report = orc.done("0074").await.unwrap();
        assert!(matches!(
            report.outcome,
            DoneOutcome::ProtocolComplete { ref phase } if phase == "review"
        ));
        assert_eq!(read_state(&orc, "0074").phase, "review");
    }

    #[test]
    fn test_gate_stamps_requested_at_once() {
        let (orc, _dir, _project) = setup_with_project();

        let first = orc.gate("0074").unwrap();
        let stamped = match first {
            GateReport::Requested {
                requested_at,
                first_request,
                ..
            } => {
                assert!(first_request);
                requested_at
            }
            other => panic!("Expected Requested, got {other:?}"),
        };

        let second = orc.gate("0074").unwrap();
        match second {
            GateReport::Requested {
                requested_at,
                first_request,
                ..
            } => {
                assert!(!first_request);
                assert_eq!(requested_at, stamped);
            }
            other => panic!("Expected Requested, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_on_phase_without_gate() {
        let (orc, _dir, _project) = setup_with_project();
        approve_all(&orc, "0074", &["spec_review"]);
        // Move into implement, which declares no gate
        let mut state = read_state(&orc, "0074");
        state.phase = "implement".to_string();
        let project_dir = orc.store.find_project("0074").unwrap();
        orc.store.write(&project_dir, &mut state).unwrap();

        assert!(matches!(
            orc.gate("0074").unwrap(),
            GateReport::NoGate { ref phase } if phase == "implement"
        ));
    }

    #[test]
    fn test_approve_unknown_gate_lists_known() {
        let (orc, _dir, _project) = setup_with_project();
        let err = orc.approve("0074", "ghost").unwrap_err();
        match err {
            OrchestratorError::UnknownGate { known, .. } => {
                assert!(known.contains(&"spec_review".to_string()));
                assert!(known.contains(&"final_review".to_string()));
            }
            other => panic!("Expected UnknownGate, got {other:?}"),
        }
    }

    #[test]
    fn test_approve_twice_preserves_first_stamp() {
        let (orc, _dir, _project) = setup_with_project();

        let first = match orc.approve("0074", "spec_review").unwrap() {
            ApproveReport::Approved { approved_at, .. } => approved_at,
            other => panic!("Expected Approved, got {other:?}"),
        };

        match orc.approve("0074", "spec_review").unwrap() {
            ApproveReport::AlreadyApproved { approved_at, .. } => {
                assert_eq!(approved_at, Some(first));
            }
            other => panic!("Expected AlreadyApproved, got {other:?}"),
        }

        let state = read_state(&orc, "0074");
        assert_eq!(state.gates["spec_review"].status, GateState::Approved);
        assert_eq!(state.gates["spec_review"].approved_at, Some(first));
    }

    #[test]
    fn test_unknown_project_id() {
        let (orc, _dir) = setup();
        let err = orc.status("9999").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(crate::errors::StateError::ProjectNotFound { .. })
        ));
    }

    #[test]
    fn test_state_with_unknown_phase_is_rejected() {
        let (orc, _dir, _project) = setup_with_project();
        let mut state = read_state(&orc, "0074");
        state.phase = "ghost".to_string();
        let project_dir = orc.store.find_project("0074").unwrap();
        orc.store.write(&project_dir, &mut state).unwrap();

        let err = orc.status("0074").unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPhase { .. }));
    }

    #[test]
    fn test_status_shows_plan_preview_before_derivation() {
        let (orc, _dir, _project) = setup_with_project();
        approve_all(&orc, "0074", &["spec_review"]);
        // Manually place the project in implement without deriving
        let mut state = read_state(&orc, "0074");
        state.phase = "implement".to_string();
        let project_dir = orc.store.find_project("0074").unwrap();
        orc.store.write(&project_dir, &mut state).unwrap();

        match orc.status("0074").unwrap() {
            StatusReport::Active { plan, .. } => {
                let plan = plan.expect("phased phase reports plan progress");
                assert_eq!(plan.phases.len(), 2);
                assert_eq!(plan.current.unwrap().id, "phase_1");
            }
            other => panic!("Expected Active, got {other:?}"),
        }
    }
}
