//! Interactive per-group decision protocol.
//!
//! Groups arrive from the classifier with every disk `Undecided`. Each group
//! is decided once, in a fixed order of questions, and the complete plan is
//! confirmed globally before anything is handed to the executor.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::{Disk, DiskGroup, DiskInfo, Disposition, NonBackedUpDisk, RestorePlan};
use crate::decide::DecisionProvider;
use crate::exec::CommandRunner;
use crate::hypervisor::Hypervisor;
use crate::pveconf::parse_disk_line;
use crate::storage::{parent_dataset, Zfs};

const ROLLBACK: &str = "rollback";
const KEEP: &str = "keep";

pub struct Reconciler<'a> {
    decisions: &'a mut dyn DecisionProvider,
    zfs: Zfs<'a>,
    hypervisor: Hypervisor<'a>,
}

impl<'a> Reconciler<'a> {
    pub fn new(decisions: &'a mut dyn DecisionProvider, runner: &'a dyn CommandRunner) -> Self {
        Self {
            decisions,
            zfs: Zfs::new(runner),
            hypervisor: Hypervisor::new(runner),
        }
    }

    /// Decide every group, print the plan and ask for the final go-ahead.
    ///
    /// Returns `None` when the operator rejects the plan.
    pub async fn reconcile(&mut self, mut groups: Vec<DiskGroup>) -> Result<Option<RestorePlan>> {
        for group in &mut groups {
            self.decide_group(group).await?;
        }

        let plan = RestorePlan { groups };
        println!();
        print!("{}", plan.summary());
        println!();

        if self.decisions.confirm("Is the information correct?")? {
            Ok(Some(plan))
        } else {
            info!("restore plan rejected by operator");
            Ok(None)
        }
    }

    async fn decide_group(&mut self, group: &mut DiskGroup) -> Result<()> {
        for disk in group.backed_up_mut() {
            let question = format!(
                "Restore {} from {}?",
                disk.info.unique_name, disk.last_snapshot
            );
            disk.disposition = if self.decisions.confirm(&question)? {
                Disposition::Restore
            } else {
                Disposition::Undecided
            };
        }

        if !group.has_restore() {
            info!(entity = %group.id, "no disk selected for restore, skipping entity");
            group.skip = true;
            for disk in group.backed_up_mut() {
                disk.disposition = Disposition::Skip;
            }
            return Ok(());
        }

        self.decide_declined(group).await?;
        self.collect_non_backed_up(group).await?;
        self.collect_orphans(group).await
    }

    /// Rollback, keep or skip for disks the operator did not restore
    async fn decide_declined(&mut self, group: &mut DiskGroup) -> Result<()> {
        let current = group.config.current();
        for disk in group.disks.iter_mut() {
            let Disk::BackedUp(disk) = disk else {
                continue;
            };
            if disk.disposition != Disposition::Undecided {
                continue;
            }

            let exists = self.zfs.exists(&disk.info.destination).await?;
            let referenced = current.references(&disk.info.unique_name);
            disk.disposition = if exists {
                let question = if referenced {
                    format!(
                        "{} is not restored. Roll back {} to {} or keep its current data?",
                        disk.info.unique_name,
                        disk.info.destination,
                        disk.restore_point()
                    )
                } else {
                    format!(
                        "{} is not restored and the restored configuration does not use it. \
                         Roll back {} to {} or keep its current data?",
                        disk.info.unique_name,
                        disk.info.destination,
                        disk.restore_point()
                    )
                };
                match self.decisions.choose(&question, &[ROLLBACK, KEEP])? {
                    ROLLBACK => Disposition::Rollback,
                    _ => Disposition::Keep,
                }
            } else if referenced {
                warn!(
                    entity = %group.id,
                    disk = %disk.info.unique_name,
                    "disk referenced by configuration is missing locally and not restored"
                );
                Disposition::Undecided
            } else {
                Disposition::Skip
            };
            debug!(disk = %disk.info.unique_name, disposition = %disk.disposition, "decided");
        }
        Ok(())
    }

    /// Disks the chosen configuration declares but the backup never captured
    async fn collect_non_backed_up(&mut self, group: &mut DiskGroup) -> Result<()> {
        let marker = format!("-{}-disk-", group.id);
        let declared: Vec<(String, String, String)> = group
            .config
            .current()
            .settings()
            .filter_map(|(key, value)| parse_disk_line(key, value).map(|disk| (disk, value)))
            .filter(|(disk, _)| disk.disk_id.contains(&marker))
            .map(|(disk, value)| (disk.slot.to_string(), disk.volume(), value.to_string()))
            .filter(|(_, volume, _)| !group.contains(volume))
            .collect();

        for (slot, volume, line) in declared {
            let destination = match self.hypervisor.resolve_path(&volume).await {
                Ok(path) => group.kind.destination_from_path(&path).unwrap_or_default(),
                Err(e) => {
                    warn!(entity = %group.id, disk = %volume, "cannot resolve path: {:#}", e);
                    String::new()
                }
            };
            let present = !destination.is_empty() && self.zfs.exists(&destination).await?;

            let recreate = if present {
                debug!(disk = %volume, "not in backup but present locally");
                false
            } else if slot.starts_with("unused") {
                warn!(entity = %group.id, disk = %volume, slot = %slot, "unused disk missing locally, not recreated");
                false
            } else {
                self.decisions.confirm(&format!(
                    "{} ({}) is not in the backup. Recreate it empty?",
                    volume, slot
                ))?
            };

            group.insert(Disk::NonBackedUp(NonBackedUpDisk {
                info: DiskInfo {
                    unique_name: volume,
                    kind: group.kind,
                    destination,
                },
                slot,
                line,
                present,
                recreate,
            }))?;
        }
        Ok(())
    }

    /// Local datasets of the entity, next to its known disks, that neither
    /// the backup nor the chosen configuration accounts for
    async fn collect_orphans(&mut self, group: &mut DiskGroup) -> Result<()> {
        let marker = format!("-{}-disk-", group.id);
        let mut storages: Vec<(String, String)> = Vec::new();
        for disk in &group.disks {
            let info = disk.info();
            let Some(parent) = parent_dataset(&info.destination) else {
                continue;
            };
            let Some((storage, _)) = info.unique_name.split_once(':') else {
                continue;
            };
            if !storages.iter().any(|(known, _)| known == parent) {
                storages.push((parent.to_string(), storage.to_string()));
            }
        }

        for (parent, storage) in storages {
            for child in self.zfs.list_children(&parent).await? {
                let Some(name) = child.rsplit('/').next() else {
                    continue;
                };
                if !name.contains(&marker) || group.destinations().any(|d| d == child) {
                    continue;
                }
                let unique_name = format!("{}:{}", storage, name);
                if group.contains(&unique_name) {
                    continue;
                }
                warn!(
                    entity = %group.id,
                    dataset = %child,
                    "local disk is neither backed up nor used by the restored configuration"
                );
                group.insert(Disk::Orphaned(DiskInfo {
                    unique_name,
                    kind: group.kind,
                    destination: child,
                }))?;
            }
        }
        Ok(())
    }
}
