//! Per-group record of what the executor did.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use tracing::error;

use crate::hypervisor::EntityType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum StepOutcome {
    Ok,
    Failed(String),
    Skipped(String),
}

impl StepOutcome {
    fn label(&self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Failed(_) => "FAILED",
            StepOutcome::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub target: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub id: String,
    pub kind: EntityType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
    /// Configuration swap failed; nothing after it ran
    pub aborted: bool,
    pub skipped: bool,
}

impl GroupReport {
    pub fn new(id: impl Into<String>, kind: EntityType) -> Self {
        Self {
            id: id.into(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            aborted: false,
            skipped: false,
        }
    }

    /// Record `result` for one step, logging failures. Returns whether it succeeded.
    pub fn record(&mut self, step: &str, target: &str, result: anyhow::Result<()>) -> bool {
        let outcome = match result {
            Ok(()) => StepOutcome::Ok,
            Err(e) => {
                error!(entity = %self.id, step, target, "{:#}", e);
                StepOutcome::Failed(format!("{:#}", e))
            }
        };
        let ok = outcome == StepOutcome::Ok;
        self.push(step, target, outcome);
        ok
    }

    pub fn skip(&mut self, step: &str, target: &str, reason: impl Into<String>) {
        self.push(step, target, StepOutcome::Skipped(reason.into()));
    }

    fn push(&mut self, step: &str, target: &str, outcome: StepOutcome) {
        self.steps.push(StepReport {
            step: step.to_string(),
            target: target.to_string(),
            outcome,
        });
    }

    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.outcome, StepOutcome::Failed(_)))
            .count()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub host: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub groups: Vec<GroupReport>,
}

impl RestoreReport {
    pub fn new(host: impl Into<String>, dry_run: bool) -> Self {
        Self {
            host: host.into(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            groups: Vec::new(),
        }
    }

    pub fn failures(&self) -> usize {
        self.groups.iter().map(GroupReport::failures).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:<12} {:<40} {:<8}",
            "ID", "TYPE", "STEP", "TARGET", "RESULT"
        );
        for group in &self.groups {
            if group.skipped {
                let _ = writeln!(out, "{:<8} {:<8} {:<12} {:<40} {:<8}", group.id, group.kind, "-", "-", "skipped");
                continue;
            }
            for step in &group.steps {
                let target = shorten(&step.target, 38);
                let _ = writeln!(
                    out,
                    "{:<8} {:<8} {:<12} {:<40} {:<8}",
                    group.id,
                    group.kind,
                    step.step,
                    target,
                    step.outcome.label()
                );
            }
            if group.aborted {
                let _ = writeln!(out, "{:<8} {:<8} aborted after configuration swap failure", group.id, group.kind);
            }
        }
        if self.dry_run {
            let _ = writeln!(out, "(dry run: no changes were made)");
        }
        out
    }
}

/// Keep the tail of `text` within `width` chars, marking the cut with `...`
fn shorten(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len <= width {
        return text.to_string();
    }
    let tail: String = text.chars().skip(len - (width - 3)).collect();
    format!("...{}", tail)
}
