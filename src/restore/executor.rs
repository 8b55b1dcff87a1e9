//! Applies a confirmed plan to one entity at a time.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::repair::Repairer;
use super::report::GroupReport;
use crate::config::Settings;
use crate::exec::CommandRunner;
use crate::hypervisor::Hypervisor;
use crate::plan::{BackedUpDisk, DiskGroup, Disposition, NonBackedUpDisk};
use crate::pveconf::RecreateSpec;
use crate::storage::{parent_dataset, Zfs};

pub struct Executor<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    zfs: Zfs<'a>,
    hypervisor: Hypervisor<'a>,
    repairer: Repairer<'a>,
}

impl<'a> Executor<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner) -> Self {
        Self {
            settings,
            runner,
            zfs: Zfs::new(runner),
            hypervisor: Hypervisor::new(runner),
            repairer: Repairer::new(runner, settings.dry_run),
        }
    }

    /// Run every step for `group`. Step failures are recorded and logged;
    /// only a failed configuration swap stops the group early.
    pub async fn execute_group(&self, group: &DiskGroup) -> GroupReport {
        let mut report = GroupReport::new(&group.id, group.kind);
        if group.skip {
            info!(entity = %group.id, "skipped");
            report.skipped = true;
            report.finish();
            return report;
        }

        let id = group.id.as_str();
        let kind = group.kind;
        info!(entity = %id, kind = %kind, config = %group.config_file, "preparing");

        report.record("shutdown", id, self.hypervisor.shutdown(kind, id).await);
        report.record("lock", id, self.hypervisor.lock(kind, id).await);

        let live = kind.config_file(&self.settings.pve_root, id);
        if !self.swap_config(group, &live, &mut report).await {
            warn!(entity = %id, "configuration swap failed, aborting entity");
            report.aborted = true;
            report.finish();
            return report;
        }

        for disk in group.backed_up() {
            self.apply_disposition(disk, &mut report).await;
        }

        report.record("unlock", id, self.hypervisor.unlock(kind, id).await);

        for disk in group.non_backed_up().filter(|disk| disk.recreate) {
            let result = self.recreate_disk(group, disk).await;
            report.record("recreate", &disk.info.unique_name, result);
        }

        let contributes = group
            .backed_up()
            .any(|disk| disk.disposition.contributes_snapshots());
        let dead_snapshots = if contributes {
            report.record("relock", id, self.hypervisor.lock(kind, id).await);
            let dead = match self.repairer.repair(group, &live).await {
                Ok(outcome) => {
                    report.record("repair", id, Ok(()));
                    outcome.dead_snapshots
                }
                Err(e) => {
                    report.record("repair", id, Err(e));
                    Vec::new()
                }
            };
            report.record("unlock", id, self.hypervisor.unlock(kind, id).await);
            dead
        } else {
            report.skip("repair", id, "no disk contributes snapshots");
            Vec::new()
        };

        for snapshot in &dead_snapshots {
            info!(entity = %id, snapshot = %snapshot, "deleting snapshot missing on every disk");
            report.record(
                "delsnapshot",
                snapshot,
                self.hypervisor.delete_snapshot(kind, id, snapshot).await,
            );
        }

        info!(entity = %id, failures = report.failures(), "finished");
        report.finish();
        report
    }

    /// Move the live configuration aside and copy the historical one in.
    ///
    /// On copy failure the original configuration is put back.
    async fn swap_config(&self, group: &DiskGroup, live: &Path, report: &mut GroupReport) -> bool {
        let live_str = live.display().to_string();
        let backup = backup_path(live);
        let backup_str = backup.display().to_string();

        let has_live = tokio::fs::try_exists(live).await.unwrap_or(false);
        if has_live {
            let moved = self
                .runner
                .execute(&["mv", &live_str, &backup_str])
                .await
                .and_then(|output| output.check(&format!("moving {} aside", live_str)));
            if !report.record("backup-config", &live_str, moved) {
                return false;
            }
        } else {
            warn!(entity = %group.id, path = %live_str, "no live configuration to back up");
            report.skip("backup-config", &live_str, "no live configuration");
        }

        let source = format!(
            "{}:{}",
            self.settings.remote(),
            self.settings.remote_config_file(&group.config_file)
        );
        let copied = self
            .runner
            .execute(&["scp", "-B", &source, &live_str])
            .await
            .and_then(|output| output.check(&format!("copying {}", source)));
        if report.record("copy-config", &live_str, copied) {
            return true;
        }

        if has_live {
            let restored = self
                .runner
                .execute(&["mv", &backup_str, &live_str])
                .await
                .and_then(|output| output.check(&format!("restoring {}", live_str)));
            report.record("restore-config", &live_str, restored);
        }
        false
    }

    async fn apply_disposition(&self, disk: &BackedUpDisk, report: &mut GroupReport) {
        let destination = disk.info.destination.as_str();
        match disk.disposition {
            Disposition::Restore => {
                info!(entity = %disk.entity_id, destination, snapshot = %disk.last_snapshot, "restoring");
                report.record("restore", destination, self.restore_disk(disk).await);
            }
            Disposition::Rollback => {
                info!(entity = %disk.entity_id, destination, to = %disk.restore_point(), "rolling back");
                report.record(
                    "rollback",
                    destination,
                    self.zfs.rollback(destination, disk.restore_point()).await,
                );
            }
            Disposition::Keep => {
                info!(entity = %disk.entity_id, destination, after = %disk.restore_point(), "destroying newer snapshots");
                let result = self
                    .zfs
                    .destroy_newer_snapshots(destination, disk.restore_point())
                    .await
                    .map(|destroyed| info!(destination, count = destroyed.len(), "newer snapshots destroyed"));
                report.record("keep", destination, result);
            }
            Disposition::Skip | Disposition::Undecided => {
                report.skip(
                    "disk",
                    &disk.info.unique_name,
                    format!("disposition {}", disk.disposition),
                );
            }
        }
    }

    /// Attach an empty disk with the declared size and options
    async fn recreate_disk(&self, group: &DiskGroup, disk: &NonBackedUpDisk) -> Result<()> {
        let spec = RecreateSpec::parse(&disk.slot, &disk.line)?;
        info!(entity = %group.id, slot = %spec.slot, allocation = %spec.allocation(), "recreating disk");
        self.hypervisor
            .attach_disk(group.kind, &group.id, &spec.slot, &spec.allocation())
            .await
    }

    async fn restore_disk(&self, disk: &BackedUpDisk) -> Result<()> {
        let destination = disk.info.destination.as_str();
        if self.zfs.exists(destination).await? {
            self.zfs
                .destroy(destination, true)
                .await
                .context("destroying current data")?;
        }

        self.zfs
            .replicate(&self.settings.remote(), &disk.last_snapshot, destination)
            .await?;

        if let Some(keyfile) = &self.settings.keyfile {
            self.load_encryption_key(destination, keyfile).await?;
        }

        self.zfs.mount(destination).await
    }

    async fn load_encryption_key(&self, destination: &str, keyfile: &Path) -> Result<()> {
        if self.zfs.is_encrypted(destination).await {
            self.zfs.set_keylocation(destination, keyfile).await?;
            self.zfs.load_key(destination).await?;
        }
        if let Some(parent) = parent_dataset(destination) {
            if self.zfs.is_encrypted(parent).await {
                self.zfs.inherit_key(destination).await?;
            }
        }
        Ok(())
    }
}

/// `<file>.backup` beside the live configuration
pub fn backup_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}
