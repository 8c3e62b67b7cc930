//! Plan phase extraction from plan documents.
//!
//! A plan document is free-form markdown. When a protocol phase is
//! plan-driven, the orchestrator needs an ordered list of sub-phases to
//! drive against, pulled from a "Phases" section using regex patterns:
//!
//! 1. Headings of the exact form `Phase <N>: <title>` inside the section
//! 2. Fallback: every sub-heading inside the section, minus recognized
//!    non-phase sub-sections (dependencies, acceptance, tests, overview)
//! 3. Final fallback: a single synthetic "Implementation" phase
//!
//! Extraction is pure and total — malformed prose degrades, it never
//! fails. Only a missing plan file is an error, because entering a
//! plan-driven phase with no plan at all is a real mistake.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

static SECTION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^(#{1,6})\s*(?:implementation\s+)?phases\s*:?\s*$").unwrap()
});

static PHASE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s*Phase\s+(\d+)\s*:\s*(.+?)\s*$").unwrap());

static ANY_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s*(.+?)\s*$").unwrap());

// Content of a phase runs to the next phase heading or top-level heading
static CONTENT_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^(?:#{1,6}\s*Phase\s+\d+\s*:|#\s)").unwrap());

/// Sub-headings recognized as plan structure rather than engineering phases.
const NON_PHASE_HEADINGS: &[&str] = &["dependencies", "acceptance", "test", "overview"];

/// Progress of one plan phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhaseStatus {
    Pending,
    InProgress,
    Complete,
}

/// A sub-unit of work extracted from a plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub id: String,
    pub title: String,
    pub status: PlanPhaseStatus,
}

impl PlanPhase {
    fn pending(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: PlanPhaseStatus::Pending,
        }
    }
}

/// Extract the ordered plan phases from plan document text.
///
/// Pure and total: identical text always yields an identical list, and the
/// list is never empty.
pub fn extract_plan_phases(text: &str) -> Vec<PlanPhase> {
    if let Some(section) = phases_section(text) {
        let phases: Vec<PlanPhase> = PHASE_HEADING
            .captures_iter(section)
            .map(|cap| PlanPhase::pending(format!("phase_{}", &cap[1]), cap[2].trim()))
            .collect();
        if !phases.is_empty() {
            return phases;
        }

        let phases: Vec<PlanPhase> = ANY_HEADING
            .captures_iter(section)
            .filter(|cap| !is_non_phase_heading(&cap[2]))
            .enumerate()
            .map(|(i, cap)| PlanPhase::pending(format!("phase_{}", i + 1), cap[2].trim()))
            .collect();
        if !phases.is_empty() {
            return phases;
        }
    }

    vec![PlanPhase::pending("phase_1", "Implementation")]
}

/// Extract plan phases from a plan document on disk.
///
/// Unlike [`extract_plan_phases`] this fails loudly when the file itself
/// cannot be read.
pub fn extract_phases_from_file(path: &Path) -> Result<Vec<PlanPhase>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan document: {}", path.display()))?;
    Ok(extract_plan_phases(&text))
}

/// The prose between a `Phase N:` heading and the next phase or top-level
/// heading, for display as working context. `None` when the phase heading
/// is not present.
pub fn phase_content(text: &str, phase_id: &str) -> Option<String> {
    let number: u64 = phase_id.strip_prefix("phase_")?.parse().ok()?;
    for cap in PHASE_HEADING.captures_iter(text) {
        if cap[1].parse::<u64>() == Ok(number) {
            let start = cap.get(0).unwrap().end();
            let rest = &text[start..];
            let end = CONTENT_BOUNDARY
                .find(rest)
                .map(|m| m.start())
                .unwrap_or(rest.len());
            return Some(rest[..end].trim().to_string());
        }
    }
    None
}

/// The first plan phase that is not complete.
pub fn current_plan_phase(phases: &[PlanPhase]) -> Option<&PlanPhase> {
    phases.iter().find(|p| p.status != PlanPhaseStatus::Complete)
}

/// The plan phase immediately following the one with the given id.
pub fn next_plan_phase<'a>(phases: &'a [PlanPhase], id: &str) -> Option<&'a PlanPhase> {
    let index = phases.iter().position(|p| p.id == id)?;
    phases.get(index + 1)
}

/// True iff every plan phase is complete (vacuously true for none).
pub fn all_plan_phases_complete(phases: &[PlanPhase]) -> bool {
    phases.iter().all(|p| p.status == PlanPhaseStatus::Complete)
}

/// Mark the named phase complete and, when a successor exists, mark exactly
/// that successor in-progress. All other phases are untouched. Returns
/// false when the id is unknown.
pub fn advance_plan_phase(phases: &mut [PlanPhase], id: &str) -> bool {
    let Some(index) = phases.iter().position(|p| p.id == id) else {
        return false;
    };
    phases[index].status = PlanPhaseStatus::Complete;
    if let Some(successor) = phases.get_mut(index + 1) {
        successor.status = PlanPhaseStatus::InProgress;
    }
    true
}

fn is_non_phase_heading(title: &str) -> bool {
    let lower = title.to_lowercase();
    NON_PHASE_HEADINGS.iter().any(|word| lower.contains(word))
}

/// The body of the "Phases" / "Implementation Phases" section: from the end
/// of its heading to the next heading at the same or a shallower level.
fn phases_section(text: &str) -> Option<&str> {
    let cap = SECTION_HEADING.captures(text)?;
    let level = cap.get(1).unwrap().as_str().len();
    let start = cap.get(0).unwrap().end();
    let rest = &text[start..];

    for heading in ANY_HEADING.captures_iter(rest) {
        if heading.get(1).unwrap().as_str().len() <= level {
            let end = heading.get(0).unwrap().start();
            return Some(&rest[..end]);
        }
    }
    Some(rest)
}
