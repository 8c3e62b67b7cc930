//! Phase status, check, done, gate and approve commands.

use anyhow::Result;
use console::style;

use cadence::checks::{CheckResult, all_checks_passed, first_failure, format_check_results};
use cadence::config::Config;
use cadence::errors::OrchestratorError;
use cadence::orchestrator::{
    ApproveReport, DoneOutcome, GateReport, Orchestrator, PlanProgress, StatusReport,
};
use cadence::plan::PlanPhaseStatus;

pub fn cmd_status(config: &Config, id: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());

    match orchestrator.status(id)? {
        StatusReport::WaitingForApproval {
            id,
            gate,
            requested_at,
            phase,
        } => {
            println!();
            println!(
                "{}",
                style("WAITING FOR HUMAN APPROVAL").yellow().bold()
            );
            println!();
            println!("Phase: {} ({})", phase.name, phase.id);
            if let Some(at) = requested_at {
                println!(
                    "Gate '{}' requested at {}",
                    gate,
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            println!();
            println!("A human must run: cadence approve {id} {gate}");
            println!();
        }
        StatusReport::Active {
            id,
            title,
            protocol,
            phase,
            plan,
            instructions,
            next_command,
            ..
        } => {
            println!();
            println!("Project {id} — {title}");
            println!(
                "Protocol: {} (phase: {}{})",
                protocol,
                phase.id,
                if phase.terminal { ", terminal" } else { "" }
            );

            if let Some(plan) = &plan {
                print_plan_progress(plan);
            }

            println!();
            for line in &instructions {
                println!("{line}");
            }
            println!();
            println!("Next: {next_command}");
            println!();
        }
    }
    Ok(())
}

pub async fn cmd_check(config: &Config, id: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());
    let results = orchestrator.check(id).await?;

    if results.is_empty() {
        println!();
        println!("No checks declared for the current phase.");
        println!();
        return Ok(());
    }

    print_check_results(&results);

    if let Some(failure) = first_failure(&results) {
        return Err(OrchestratorError::ChecksFailed {
            phase: id.to_string(),
            failed: failure.name.clone(),
        }
        .into());
    }
    println!("All checks passed.");
    println!();
    Ok(())
}

pub async fn cmd_done(config: &Config, id: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());
    let report = orchestrator.done(id).await?;

    if !report.results.is_empty() {
        print_check_results(&report.results);
    }

    match report.outcome {
        DoneOutcome::ChecksFailed { phase, failed } => {
            println!("{}", style("Phase not advanced.").red());
            println!();
            Err(OrchestratorError::ChecksFailed { phase, failed }.into())
        }
        DoneOutcome::GateBlocked { gate } => {
            println!("{}", style("Phase not advanced.").red());
            println!();
            Err(OrchestratorError::GateBlocked {
                id: id.to_string(),
                gate,
            }
            .into())
        }
        DoneOutcome::PlanPhaseAdvanced { completed, next } => {
            println!(
                "{} plan phase {}: {}",
                style("Completed").green(),
                completed.id,
                completed.title
            );
            match next {
                Some(next) => {
                    println!("Now in progress: {} — {}", next.id, next.title);
                    println!();
                    println!("Next: cadence status {id}");
                }
                None => {
                    println!("All plan phases complete.");
                    println!();
                    println!("Next: cadence done {id}");
                }
            }
            println!();
            Ok(())
        }
        DoneOutcome::PhaseAdvanced {
            from,
            to,
            entered_plan_phases,
        } => {
            println!("{} {} -> {}", style("Phase advanced:").green(), from, to);
            if let Some(count) = entered_plan_phases {
                println!("Derived {count} plan phases from the plan document.");
            }
            println!();
            println!("Next: cadence status {id}");
            println!();
            Ok(())
        }
        DoneOutcome::ProtocolComplete { phase } => {
            println!(
                "{} Final phase '{}' is complete.",
                style("Protocol complete.").green().bold(),
                phase
            );
            println!();
            Ok(())
        }
    }
}

pub fn cmd_gate(config: &Config, id: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());

    match orchestrator.gate(id)? {
        GateReport::NoGate { phase } => {
            println!();
            println!("Phase '{phase}' declares no gate.");
            println!();
            println!("Next: cadence done {id}");
            println!();
        }
        GateReport::AlreadyApproved { gate, approved_at } => {
            println!();
            println!("Gate '{gate}' is already approved.");
            if let Some(at) = approved_at {
                println!("Approved at {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!();
            println!("Next: cadence done {id}");
            println!();
        }
        GateReport::Requested {
            gate,
            requested_at,
            first_request,
        } => {
            println!();
            if first_request {
                println!("Approval requested for gate '{gate}'.");
            } else {
                println!(
                    "Approval for gate '{gate}' was already requested at {}.",
                    requested_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            println!();
            println!(
                "{}",
                style("STOP — a human must review and approve before work continues.")
                    .yellow()
                    .bold()
            );
            println!("To approve: cadence approve {id} {gate}");
            println!();
        }
    }
    Ok(())
}

pub fn cmd_approve(config: &Config, id: &str, gate: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());

    match orchestrator.approve(id, gate)? {
        ApproveReport::AlreadyApproved { gate, approved_at } => {
            println!();
            println!("Gate '{gate}' was already approved; nothing changed.");
            if let Some(at) = approved_at {
                println!("Original approval: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!();
        }
        ApproveReport::Approved { gate, approved_at } => {
            println!();
            println!(
                "{} gate '{}' at {}",
                style("Approved").green(),
                gate,
                approved_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!();
            println!("Next: cadence done {id}");
            println!();
        }
    }
    Ok(())
}

fn print_check_results(results: &[CheckResult]) {
    println!();
    println!("Checks:");
    print!("{}", format_check_results(results));
    if all_checks_passed(results) {
        println!();
    }
}

fn print_plan_progress(plan: &PlanProgress) {
    let complete = plan
        .phases
        .iter()
        .filter(|p| p.status == PlanPhaseStatus::Complete)
        .count();
    println!("Plan phases: {}/{} complete", complete, plan.phases.len());

    for phase in &plan.phases {
        let marker = match phase.status {
            PlanPhaseStatus::Complete => style("done").green().to_string(),
            PlanPhaseStatus::InProgress => style("in progress").yellow().to_string(),
            PlanPhaseStatus::Pending => style("pending").dim().to_string(),
        };
        println!("  {:<10} {} ({})", phase.id, phase.title, marker);
    }

    if let Some(content) = &plan.content
        && !content.is_empty()
    {
        println!();
        println!("Current plan phase notes:");
        for line in content.lines().take(12) {
            println!("  {line}");
        }
    }
}
