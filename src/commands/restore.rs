use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{GlobalArgs, RestoreArgs};
use crate::config::Settings;
use crate::decide::{DecisionProvider, TerminalPrompt};
use crate::exec::{CommandRunner, SystemRunner};
use crate::lock::HostLock;
use crate::plan::{discover, Reconciler};
use crate::restore::{run_plan, RestoreReport};

/// Discover, decide and restore entities from a replication target
pub async fn cmd_restore(globals: &GlobalArgs, args: RestoreArgs) -> Result<()> {
    let settings = Settings::from_args(globals, args);
    let runner = SystemRunner::new(settings.dry_run).with_output_logging(settings.debug);
    let mut prompt = TerminalPrompt::stdin();

    match restore(&settings, &runner, &mut prompt).await? {
        Some(report) => print_report(&settings, &report),
        None => {
            println!("Restore cancelled.");
            Ok(())
        }
    }
}

/// The whole run against an arbitrary runner and decision provider.
///
/// Returns `None` when there is nothing to do or the operator rejects the plan.
pub async fn restore(
    settings: &Settings,
    runner: &dyn CommandRunner,
    decisions: &mut dyn DecisionProvider,
) -> Result<Option<RestoreReport>> {
    info!(
        host = %settings.host,
        pool = %settings.source_pool,
        backup_name = %settings.backup_name,
        dry_run = settings.dry_run,
        "starting restore"
    );

    let groups = discover(settings, runner).await?;
    if groups.is_empty() {
        warn!(pool = %settings.source_pool, "no restorable disks found");
        return Ok(None);
    }

    let plan = {
        let mut reconciler = Reconciler::new(decisions, runner);
        reconciler.reconcile(groups).await?
    };
    let Some(plan) = plan else {
        return Ok(None);
    };

    let lock = HostLock::acquire(&settings.lock_dir, &settings.host)?;
    let report = run_plan(settings, runner, &plan).await;
    lock.release()?;

    Ok(Some(report))
}

fn print_report(settings: &Settings, report: &RestoreReport) -> Result<()> {
    if settings.json {
        let json = report.to_json().context("serializing restore report")?;
        println!("{}", json);
    } else {
        print!("{}", report.render_table());
    }

    let failures = report.failures();
    if failures > 0 {
        warn!(failures, "restore finished with failed steps");
    } else {
        info!("restore finished");
    }
    Ok(())
}
