//! Hypervisor entity types and their command families.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::exec::CommandRunner;
use crate::paths;

/// Lock token set on entities while a restore rewrites them
pub const RESTORE_LOCK: &str = "backup";

/// Kind of entity a disk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Container,
    Vm,
}

impl EntityType {
    /// Command-line tool for this entity type
    pub fn tool(&self) -> &'static str {
        match self {
            EntityType::Container => "pct",
            EntityType::Vm => "qm",
        }
    }

    /// Infer the type from a point-in-time configuration file name
    pub fn from_config_file_name(name: &str) -> Option<Self> {
        if name.contains("qemu") {
            Some(EntityType::Vm)
        } else if name.contains("lxc") {
            Some(EntityType::Container)
        } else {
            None
        }
    }

    /// Live configuration file of entity `id`
    pub fn config_file(&self, pve_root: &Path, id: &str) -> PathBuf {
        let dir = match self {
            EntityType::Container => paths::container_config_dir(pve_root),
            EntityType::Vm => paths::vm_config_dir(pve_root),
        };
        dir.join(format!("{}.conf", id))
    }

    /// Local storage object name from a resolved volume path.
    ///
    /// Containers resolve to a mount path (`/rpool/data/subvol-100-disk-0`),
    /// VMs to a block device (`/dev/zvol/rpool/data/vm-100-disk-0`).
    pub fn destination_from_path(&self, path: &str) -> Option<String> {
        let path = path.trim();
        let dataset = match self {
            EntityType::Container => path.strip_prefix('/')?,
            EntityType::Vm => path.split_once("/dev/zvol/")?.1,
        };
        if dataset.is_empty() {
            None
        } else {
            Some(dataset.to_string())
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Container => write!(f, "lxc"),
            EntityType::Vm => write!(f, "qemu"),
        }
    }
}

/// Hypervisor command wrapper
pub struct Hypervisor<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Hypervisor<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub async fn shutdown(&self, kind: EntityType, id: &str) -> Result<()> {
        self.runner
            .execute(&[kind.tool(), "shutdown", id])
            .await?
            .check(&format!("{} shutdown {}", kind.tool(), id))
    }

    pub async fn lock(&self, kind: EntityType, id: &str) -> Result<()> {
        let lock = format!("--lock={}", RESTORE_LOCK);
        self.runner
            .execute(&[kind.tool(), "set", id, &lock])
            .await?
            .check(&format!("{} set {} {}", kind.tool(), id, lock))
    }

    pub async fn unlock(&self, kind: EntityType, id: &str) -> Result<()> {
        self.runner
            .execute(&[kind.tool(), "unlock", id])
            .await?
            .check(&format!("{} unlock {}", kind.tool(), id))
    }

    /// Allocate and attach a new disk: `<tool> set <id> --<slot> <allocation>`
    pub async fn attach_disk(
        &self,
        kind: EntityType,
        id: &str,
        slot: &str,
        allocation: &str,
    ) -> Result<()> {
        let flag = format!("--{}", slot);
        self.runner
            .execute(&[kind.tool(), "set", id, &flag, allocation])
            .await?
            .check(&format!("{} set {} {} {}", kind.tool(), id, flag, allocation))
    }

    /// Point-in-time snapshot names recorded for the entity, without `current`
    pub async fn list_snapshots(&self, kind: EntityType, id: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .query(&[kind.tool(), "listsnapshot", id])
            .await?;
        output.check(&format!("{} listsnapshot {}", kind.tool(), id))?;
        Ok(parse_snapshot_listing(&output.stdout))
    }

    pub async fn delete_snapshot(&self, kind: EntityType, id: &str, name: &str) -> Result<()> {
        self.runner
            .execute(&[kind.tool(), "delsnapshot", id, name, "--force"])
            .await?
            .check(&format!("{} delsnapshot {} {}", kind.tool(), id, name))
    }

    /// Resolve a `<pool>:<disk-id>` volume to its local path
    pub async fn resolve_path(&self, volume: &str) -> Result<String> {
        let output = self
            .runner
            .query(&["pvesm", "path", volume])
            .await
            .context("executing pvesm path")?;
        output.check(&format!("pvesm path {}", volume))?;
        let path = output.lines().next().map(str::to_string);
        path.with_context(|| format!("pvesm path {} returned nothing", volume))
    }
}

/// Parse the tree printed by `listsnapshot`:
///
/// ```text
/// `-> daily_2024-01-01    2024-01-01 00:00:00     no-description
///   `-> daily_2024-01-02  2024-01-02 00:00:00     no-description
///     `-> current                                 You are here!
/// ```
pub fn parse_snapshot_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            line.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '`' | '-' | '>' | '|'))
                .split_whitespace()
                .next()
        })
        .filter(|name| *name != "current")
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_from_path() {
        assert_eq!(
            EntityType::Vm.destination_from_path("/dev/zvol/rpool/data/vm-100-disk-0\n"),
            Some("rpool/data/vm-100-disk-0".to_string())
        );
        assert_eq!(
            EntityType::Container.destination_from_path("/rpool/data/subvol-101-disk-0"),
            Some("rpool/data/subvol-101-disk-0".to_string())
        );
        assert_eq!(EntityType::Vm.destination_from_path("/rpool/data/x"), None);
        assert_eq!(EntityType::Container.destination_from_path("/"), None);
    }

    #[test]
    fn test_config_file() {
        let root = Path::new("/etc/pve");
        assert_eq!(
            EntityType::Vm.config_file(root, "100"),
            PathBuf::from("/etc/pve/qemu-server/100.conf")
        );
        assert_eq!(
            EntityType::Container.config_file(root, "101"),
            PathBuf::from("/etc/pve/lxc/101.conf")
        );
    }

    #[test]
    fn test_type_from_config_file_name() {
        assert_eq!(
            EntityType::from_config_file_name("100.conf.qemu.rep_daily_2024-01-02_00:00:01"),
            Some(EntityType::Vm)
        );
        assert_eq!(
            EntityType::from_config_file_name("101.conf.lxc.rep_daily_2024-01-02_00:00:01"),
            Some(EntityType::Container)
        );
        assert_eq!(EntityType::from_config_file_name("101.conf"), None);
    }

    #[test]
    fn test_parse_snapshot_listing() {
        let listing = "`-> daily_2024-01-01    2024-01-01 00:00:00     no-description\n  `-> daily_2024-01-02  2024-01-02 00:00:00     no-description\n    `-> current                                 You are here!\n";
        assert_eq!(
            parse_snapshot_listing(listing),
            ["daily_2024-01-01", "daily_2024-01-02"]
        );
        assert!(parse_snapshot_listing("`-> current  You are here!\n").is_empty());
    }
}
