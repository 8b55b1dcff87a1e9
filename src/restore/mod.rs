//! Restore execution: per-entity executor, snapshot-metadata repair and the
//! run report.

pub mod executor;
pub mod repair;
pub mod report;

pub use executor::Executor;
pub use repair::{prune_snapshot_references, Repairer};
pub use report::{GroupReport, RestoreReport, StepOutcome};

use crate::config::Settings;
use crate::exec::CommandRunner;
use crate::plan::RestorePlan;

/// Execute every group of `plan` in order. A failing group never stops the
/// groups after it.
pub async fn run_plan(settings: &Settings, runner: &dyn CommandRunner, plan: &RestorePlan) -> RestoreReport {
    let executor = Executor::new(settings, runner);
    let mut report = RestoreReport::new(&settings.host, settings.dry_run);
    for group in &plan.groups {
        report.groups.push(executor.execute_group(group).await);
    }
    report.finished_at = Some(chrono::Utc::now());
    report
}
