//! Restore plan: disks, their dispositions, and per-entity groups.

pub mod classify;
pub mod reconcile;

pub use classify::{discover, Classifier};
pub use reconcile::Reconciler;

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt::{self, Write as _};

use crate::hypervisor::EntityType;
use crate::pveconf::PveConfig;
use crate::storage::snapshot_suffix;

/// What happens to a backed-up disk during restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    #[default]
    Undecided,
    /// Replace with the historical snapshot from the backup host
    Restore,
    /// Roll back in place to the matching local snapshot
    Rollback,
    /// Keep current data, drop local snapshots newer than the restore point
    Keep,
    Skip,
}

impl Disposition {
    /// Whether this disk ends up with a snapshot timeline tied to the restore point
    pub fn contributes_snapshots(&self) -> bool {
        matches!(self, Disposition::Restore | Disposition::Rollback | Disposition::Keep)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Disposition::Undecided => "undecided",
            Disposition::Restore => "restore",
            Disposition::Rollback => "rollback",
            Disposition::Keep => "keep",
            Disposition::Skip => "skip",
        };
        f.write_str(label)
    }
}

/// Fields every disk has
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    /// `<pool>:<disk-id>`, stable across backup host and local hypervisor
    pub unique_name: String,
    pub kind: EntityType,
    /// Local storage object the disk resolves to; may not exist yet
    pub destination: String,
}

/// A disk present on the backup host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackedUpDisk {
    pub info: DiskInfo,
    pub entity_id: String,
    /// Storage object on the backup host
    pub object: String,
    /// Fully-qualified historical snapshot to restore from
    pub last_snapshot: String,
    /// Point-in-time configuration file covering `last_snapshot`
    pub last_config: String,
    pub disposition: Disposition,
}

impl BackedUpDisk {
    /// Short name of the restore point (`daily_2024-01-02`)
    pub fn restore_point(&self) -> &str {
        snapshot_suffix(&self.last_snapshot).unwrap_or(&self.last_snapshot)
    }
}

/// A disk declared in configuration but absent from the backup host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonBackedUpDisk {
    pub info: DiskInfo,
    /// Hardware slot (`scsi1`, `mp0`)
    pub slot: String,
    /// Raw value of the configuration line, needed to recreate the disk
    pub line: String,
    /// Already exists locally, nothing to do
    pub present: bool,
    pub recreate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Disk {
    BackedUp(BackedUpDisk),
    NonBackedUp(NonBackedUpDisk),
    /// Local dataset of the entity that is neither backed up nor declared by
    /// the chosen configuration. Never touched.
    Orphaned(DiskInfo),
}

impl Disk {
    pub fn info(&self) -> &DiskInfo {
        match self {
            Disk::BackedUp(disk) => &disk.info,
            Disk::NonBackedUp(disk) => &disk.info,
            Disk::Orphaned(info) => info,
        }
    }

    pub fn unique_name(&self) -> &str {
        &self.info().unique_name
    }

    /// Whether this disk belongs to the entity after the restore and must be
    /// taken into account when repairing snapshot metadata
    pub fn considered_for_repair(&self) -> bool {
        match self {
            Disk::BackedUp(disk) => disk.disposition.contributes_snapshots(),
            Disk::NonBackedUp(disk) => disk.present || disk.recreate,
            Disk::Orphaned(_) => false,
        }
    }
}

/// All disks of one entity, restored together
#[derive(Debug, Clone, Serialize)]
pub struct DiskGroup {
    pub id: String,
    pub kind: EntityType,
    /// Point-in-time configuration file chosen for the entity
    pub config_file: String,
    #[serde(skip)]
    pub config: PveConfig,
    pub disks: Vec<Disk>,
    pub skip: bool,
}

impl PartialEq for DiskGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl DiskGroup {
    pub fn new(id: impl Into<String>, kind: EntityType, config_file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            config_file: config_file.into(),
            config: PveConfig::parse(""),
            disks: Vec::new(),
            skip: false,
        }
    }

    /// Add a disk, keeping `unique_name` unique and the entity type consistent
    pub fn insert(&mut self, disk: Disk) -> Result<()> {
        if self.contains(disk.unique_name()) {
            bail!(
                "entity {} already has a disk named {}",
                self.id,
                disk.unique_name()
            );
        }
        if let Disk::BackedUp(backed_up) = &disk {
            if backed_up.info.kind != self.kind {
                bail!(
                    "entity {} mixes {} and {} disks ({})",
                    self.id,
                    self.kind,
                    backed_up.info.kind,
                    backed_up.info.unique_name
                );
            }
        }
        self.disks.push(disk);
        Ok(())
    }

    pub fn contains(&self, unique_name: &str) -> bool {
        self.disks.iter().any(|disk| disk.unique_name() == unique_name)
    }

    pub fn backed_up(&self) -> impl Iterator<Item = &BackedUpDisk> {
        self.disks.iter().filter_map(|disk| match disk {
            Disk::BackedUp(disk) => Some(disk),
            _ => None,
        })
    }

    pub fn backed_up_mut(&mut self) -> impl Iterator<Item = &mut BackedUpDisk> {
        self.disks.iter_mut().filter_map(|disk| match disk {
            Disk::BackedUp(disk) => Some(disk),
            _ => None,
        })
    }

    pub fn non_backed_up(&self) -> impl Iterator<Item = &NonBackedUpDisk> {
        self.disks.iter().filter_map(|disk| match disk {
            Disk::NonBackedUp(disk) => Some(disk),
            _ => None,
        })
    }

    /// Local storage objects the group already accounts for
    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.disks
            .iter()
            .map(|disk| disk.info().destination.as_str())
            .filter(|destination| !destination.is_empty())
    }

    /// Restore point of the group (`daily_2024-01-02`)
    pub fn restore_point(&self) -> Option<&str> {
        self.backed_up()
            .find(|disk| disk.disposition == Disposition::Restore)
            .or_else(|| self.backed_up().next())
            .map(BackedUpDisk::restore_point)
    }

    pub fn has_restore(&self) -> bool {
        self.backed_up()
            .any(|disk| disk.disposition == Disposition::Restore)
    }

    /// Restore/rollback/keep disks and surviving non-backed-up disks
    pub fn repair_candidates(&self) -> impl Iterator<Item = &Disk> {
        self.disks.iter().filter(|disk| disk.considered_for_repair())
    }
}

/// Finalized, operator-confirmed plan
#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub groups: Vec<DiskGroup>,
}

impl RestorePlan {
    /// Human-readable plan, one section per entity
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for group in &self.groups {
            if group.skip {
                let _ = writeln!(out, "ID: {} skipped!", group.id);
                continue;
            }
            let _ = writeln!(out, "ID: {} ({}) from {}:", group.id, group.kind, group.config_file);
            for disk in &group.disks {
                let _ = writeln!(out, "  {}", describe(disk));
            }
        }
        out
    }
}

fn describe(disk: &Disk) -> String {
    match disk {
        Disk::BackedUp(disk) => match disk.disposition {
            Disposition::Restore => format!(
                "RESTORE: {} from {} to {}",
                disk.info.unique_name, disk.last_snapshot, disk.info.destination
            ),
            Disposition::Rollback => format!(
                "ROLLBACK: {} to {}@{}",
                disk.info.unique_name,
                disk.info.destination,
                disk.restore_point()
            ),
            Disposition::Keep => format!(
                "KEEP DATA: {} (destroying snapshots newer than {})",
                disk.info.destination,
                disk.restore_point()
            ),
            Disposition::Skip => format!("SKIP: {}", disk.info.unique_name),
            Disposition::Undecided => format!(
                "WARNING: {} is referenced by the configuration but missing locally; \
                 the entity will be restored without it",
                disk.info.unique_name
            ),
        },
        Disk::NonBackedUp(disk) if disk.recreate => format!(
            "RECREATE: {} as {} (empty)",
            disk.info.unique_name, disk.slot
        ),
        Disk::NonBackedUp(disk) if disk.present => {
            format!("EXISTING: {} (not in backup, kept as is)", disk.info.unique_name)
        }
        Disk::NonBackedUp(disk) => format!("SKIP: {} (not in backup)", disk.info.unique_name),
        Disk::Orphaned(info) => format!(
            "WARNING: {} exists but is neither backed up nor used by the restored \
             configuration; left untouched",
            info.destination
        ),
    }
}

#[cfg(test)]
pub(crate) fn backed_up_disk(id: &str, unique_name: &str, snapshot: &str) -> BackedUpDisk {
    let disk_id = unique_name.split_once(':').map(|(_, d)| d).unwrap_or(unique_name);
    BackedUpDisk {
        info: DiskInfo {
            unique_name: unique_name.to_string(),
            kind: EntityType::Vm,
            destination: format!("rpool/data/{}", disk_id),
        },
        entity_id: id.to_string(),
        object: format!("tank/replica/{}", disk_id),
        last_snapshot: format!("tank/replica/{}@{}", disk_id, snapshot),
        last_config: format!("{}.conf.qemu.{}", id, snapshot),
        disposition: Disposition::Undecided,
    }
}
