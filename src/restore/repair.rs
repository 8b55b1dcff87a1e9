//! Snapshot-metadata repair.
//!
//! After a partial restore the entity's point-in-time snapshot blocks may
//! reference disks that no longer carry that snapshot. Those references are
//! removed so every snapshot block only names disks holding the snapshot.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::exec::CommandRunner;
use crate::hypervisor::Hypervisor;
use crate::plan::{Disk, DiskGroup};
use crate::pveconf::{parse_disk_line, PveConfig};
use crate::storage::Zfs;

/// One disk line removed from one snapshot block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedReference {
    pub snapshot: String,
    pub disk: String,
    pub slot: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairOutcome {
    pub removed: Vec<RemovedReference>,
    /// Recorded snapshots present on none of the considered disks
    pub dead_snapshots: Vec<String>,
}

/// Remove, per disk, its line from every snapshot block whose snapshot the
/// disk does not carry. `disks` pairs a unique name with its on-disk
/// snapshot names.
pub fn prune_snapshot_references(
    config: &mut PveConfig,
    snapshot_names: &[String],
    disks: &[(String, HashSet<String>)],
) -> Vec<RemovedReference> {
    let mut removed = Vec::new();
    for (disk, present) in disks {
        for snapshot in snapshot_names {
            if present.contains(snapshot) {
                continue;
            }
            let Some(block) = config.snapshot_mut(snapshot) else {
                continue;
            };
            if let Some(slot) = block.remove_disk(disk) {
                removed.push(RemovedReference {
                    snapshot: snapshot.clone(),
                    disk: disk.clone(),
                    slot,
                });
            }
        }
    }
    removed
}

/// Snapshots that exist on none of `disks`
pub fn dead_snapshots(snapshot_names: &[String], disks: &[(String, HashSet<String>)]) -> Vec<String> {
    if disks.is_empty() {
        return Vec::new();
    }
    snapshot_names
        .iter()
        .filter(|name| disks.iter().all(|(_, present)| !present.contains(*name)))
        .cloned()
        .collect()
}

pub struct Repairer<'a> {
    zfs: Zfs<'a>,
    hypervisor: Hypervisor<'a>,
    dry_run: bool,
}

impl<'a> Repairer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, dry_run: bool) -> Self {
        Self {
            zfs: Zfs::new(runner),
            hypervisor: Hypervisor::new(runner),
            dry_run,
        }
    }

    /// Prune stale snapshot references from the live configuration at
    /// `config_file` and report which recorded snapshots are dead.
    pub async fn repair(&self, group: &DiskGroup, config_file: &Path) -> Result<RepairOutcome> {
        let snapshot_names = self
            .hypervisor
            .list_snapshots(group.kind, &group.id)
            .await
            .context("listing recorded snapshots")?;

        let text = tokio::fs::read_to_string(config_file)
            .await
            .with_context(|| format!("reading {}", config_file.display()))?;
        let mut config = PveConfig::parse(&text);

        let mut disks = Vec::new();
        for disk in group.repair_candidates() {
            let present = self.snapshots_of(&disk.info().destination).await?;
            disks.push((disk.unique_name().to_string(), present));

            // The hypervisor names recreated volumes itself
            let Disk::NonBackedUp(recreated) = disk else {
                continue;
            };
            if !recreated.recreate {
                continue;
            }
            let allocated = self.allocated_volume(group, &config, &recreated.slot).await;
            if let Some((volume, destination)) = allocated {
                if volume != recreated.info.unique_name {
                    info!(
                        entity = %group.id,
                        slot = %recreated.slot,
                        %volume,
                        "recreated disk got a new volume name"
                    );
                    let present = self.snapshots_of(&destination).await?;
                    disks.push((volume, present));
                }
            }
        }

        let removed = prune_snapshot_references(&mut config, &snapshot_names, &disks);
        for reference in &removed {
            info!(
                entity = %group.id,
                snapshot = %reference.snapshot,
                disk = %reference.disk,
                slot = %reference.slot,
                "removed stale snapshot reference"
            );
        }

        if removed.is_empty() {
            debug!(entity = %group.id, "snapshot metadata consistent");
        } else if self.dry_run {
            info!(path = %config_file.display(), "dry run: would rewrite configuration");
        } else {
            tokio::fs::write(config_file, config.render())
                .await
                .with_context(|| format!("writing {}", config_file.display()))?;
        }

        Ok(RepairOutcome {
            removed,
            dead_snapshots: dead_snapshots(&snapshot_names, &disks),
        })
    }

    async fn snapshots_of(&self, destination: &str) -> Result<HashSet<String>> {
        self.zfs
            .snapshot_names(destination)
            .await
            .with_context(|| format!("listing snapshots of {}", destination))
    }

    /// Volume the live configuration holds in `slot`, with its local storage object
    async fn allocated_volume(
        &self,
        group: &DiskGroup,
        config: &PveConfig,
        slot: &str,
    ) -> Option<(String, String)> {
        let value = config.current().get(slot)?;
        let volume = parse_disk_line(slot, value)?.volume();
        match self.hypervisor.resolve_path(&volume).await {
            Ok(path) => {
                let destination = group.kind.destination_from_path(&path)?;
                Some((volume, destination))
            }
            Err(e) => {
                warn!(entity = %group.id, %volume, "cannot resolve recreated disk: {:#}", e);
                None
            }
        }
    }
}
