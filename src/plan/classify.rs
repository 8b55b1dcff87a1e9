//! Disk classification: from raw storage object names on the backup host to
//! [`BackedUpDisk`] records grouped per entity.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, info};

use super::{BackedUpDisk, Disk, DiskGroup, DiskInfo, Disposition};
use crate::config::Settings;
use crate::error::DiscoveryError;
use crate::exec::CommandRunner;
use crate::hypervisor::{EntityType, Hypervisor};
use crate::inventory::RemoteInventory;
use crate::pveconf::{ConfigBlock, PveConfig};
use crate::storage::snapshot_suffix;

/// Parsed `(basevol|subvol|vm)-<id>-disk-<n>` object name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName {
    pub prefix: String,
    pub entity_id: String,
    pub disk_number: u32,
}

fn object_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(basevol|subvol|vm)-(\d+)-disk-(\d+)$").expect("valid object name regex")
    })
}

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{4}-\d{2}-\d{2})_(\d{2}:\d{2}:\d{2})").expect("valid timestamp regex")
    })
}

/// Last path segment of a storage object
pub fn object_short_name(object: &str) -> &str {
    object.rsplit('/').next().unwrap_or(object)
}

pub fn parse_object_name(short_name: &str) -> Option<ObjectName> {
    let caps = object_name_regex().captures(short_name)?;
    Some(ObjectName {
        prefix: caps[1].to_string(),
        entity_id: caps[2].to_string(),
        disk_number: caps[3].parse().ok()?,
    })
}

/// Ordering key for point-in-time configuration files: embedded timestamp
/// first, then the full name as sequence tie-breaker
pub fn config_sort_key(name: &str) -> (Option<NaiveDateTime>, &str) {
    let timestamp = timestamp_regex().captures(name).and_then(|caps| {
        NaiveDateTime::parse_from_str(&format!("{} {}", &caps[1], &caps[2]), "%Y-%m-%d %H:%M:%S").ok()
    });
    (timestamp, name)
}

/// Configuration files for `entity_id` taken at `snapshot_name`, newest first
pub fn matching_config_files<'f>(
    files: &'f [String],
    entity_id: &str,
    snapshot_name: &str,
) -> Vec<&'f str> {
    let prefix = format!("{}.conf", entity_id);
    let mut matches: Vec<&str> = files
        .iter()
        .map(|file| file.rsplit('/').next().unwrap_or(file))
        .filter(|file| file.starts_with(&prefix) && file.contains(snapshot_name))
        .collect();
    matches.sort_by(|a, b| config_sort_key(b).cmp(&config_sort_key(a)));
    matches
}

/// `<pool>:<disk-id>` of `object` as referenced by the configuration block.
///
/// When the disk id appears on more than one line the replication tool
/// prefixed dataset names with the storage id, so the storage is taken from
/// the path segment before the disk name instead.
pub fn disk_volume(block: &ConfigBlock, object: &str) -> Result<String, DiscoveryError> {
    let short = object_short_name(object);
    let matches: Vec<String> = block
        .disks()
        .filter(|disk| disk.disk_id == short)
        .map(|disk| disk.volume())
        .collect();

    match matches.as_slice() {
        [volume] => Ok(volume.clone()),
        [] => Err(DiscoveryError::classification(
            object,
            "disk is not referenced by its configuration",
        )),
        _ => object
            .rsplit('/')
            .nth(1)
            .map(|storage| format!("{}:{}", storage, short))
            .ok_or_else(|| {
                DiscoveryError::classification(object, "ambiguous configuration lines and no storage segment")
            }),
    }
}

pub struct Classifier<'a> {
    settings: &'a Settings,
    inventory: RemoteInventory<'a>,
    hypervisor: Hypervisor<'a>,
    config_files: Option<Vec<String>>,
    configs: HashMap<String, PveConfig>,
}

impl<'a> Classifier<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner) -> Self {
        Self {
            settings,
            inventory: RemoteInventory::new(runner, &settings.ssh_user, &settings.host),
            hypervisor: Hypervisor::new(runner),
            config_files: None,
            configs: HashMap::new(),
        }
    }

    pub fn inventory(&self) -> &RemoteInventory<'a> {
        &self.inventory
    }

    async fn config_files(&mut self) -> Result<&[String]> {
        if self.config_files.is_none() {
            let files = self
                .inventory
                .list_directory(&self.settings.config_path)
                .await?;
            self.config_files = Some(files);
        }
        Ok(self.config_files.as_deref().unwrap_or_default())
    }

    /// Point-in-time configuration, read once per file
    pub async fn load_config(&mut self, name: &str) -> Result<&PveConfig> {
        if !self.configs.contains_key(name) {
            let text = self
                .inventory
                .read_remote_file(&self.settings.remote_config_file(name))
                .await?;
            self.configs.insert(name.to_string(), PveConfig::parse(&text));
        }
        self.configs
            .get(name)
            .with_context(|| format!("configuration {} not cached", name))
    }

    /// Classify one storage object.
    ///
    /// Returns `None` when the object has no snapshot tagged with the backup
    /// name or no configuration file covering that snapshot.
    pub async fn classify(&mut self, object: &str) -> Result<Option<BackedUpDisk>> {
        let short = object_short_name(object);
        let parsed = parse_object_name(short).ok_or_else(|| {
            DiscoveryError::classification(object, "name does not match <type>-<id>-disk-<n>")
        })?;

        let snapshots = self.inventory.list_snapshots(object).await?;
        let backup_name = &self.settings.backup_name;
        let Some(last_snapshot) = snapshots
            .iter()
            .rev()
            .find(|snap| snapshot_suffix(snap).is_some_and(|name| name.contains(backup_name.as_str())))
            .cloned()
        else {
            debug!(object, backup_name = %backup_name, "no snapshot with backup name, skipping");
            return Ok(None);
        };
        let snapshot_name = snapshot_suffix(&last_snapshot).unwrap_or_default().to_string();

        let entity_id = parsed.entity_id;
        let files = self.config_files().await?;
        let Some(last_config) = matching_config_files(files, &entity_id, &snapshot_name)
            .first()
            .map(|file| file.to_string())
        else {
            debug!(object, snapshot = %last_snapshot, "no configuration file for snapshot, skipping");
            return Ok(None);
        };

        let kind = EntityType::from_config_file_name(&last_config).ok_or_else(|| {
            DiscoveryError::classification(
                object,
                format!("cannot tell VM from container by file name {}", last_config),
            )
        })?;

        let config = self.load_config(&last_config).await?;
        let volume = disk_volume(config.current(), object)?;

        let path = self
            .hypervisor
            .resolve_path(&volume)
            .await
            .map_err(|e| DiscoveryError::LocalCommand {
                command: format!("pvesm path {}", volume),
                stderr: format!("{:#}", e),
            })?;
        let destination = kind.destination_from_path(&path).ok_or_else(|| {
            DiscoveryError::classification(object, format!("unexpected {} path {}", kind, path))
        })?;

        debug!(
            object,
            entity = %entity_id,
            snapshot = %last_snapshot,
            config = %last_config,
            destination = %destination,
            "classified disk"
        );

        Ok(Some(BackedUpDisk {
            info: DiskInfo {
                unique_name: volume,
                kind,
                destination,
            },
            entity_id,
            object: object.to_string(),
            last_snapshot,
            last_config,
            disposition: Disposition::Undecided,
        }))
    }
}

/// Discover every restorable disk on the backup host and group them by entity
pub async fn discover(settings: &Settings, runner: &dyn CommandRunner) -> Result<Vec<DiskGroup>> {
    let mut classifier = Classifier::new(settings, runner);
    let objects = classifier
        .inventory()
        .list_storage_objects(&settings.source_pool)
        .await?;

    let pool_prefix = format!("{}/", settings.source_pool);
    let candidates: Vec<String> = objects
        .into_iter()
        .filter(|object| object.starts_with(&pool_prefix))
        .filter(|object| parse_object_name(object_short_name(object)).is_some())
        .filter(|object| {
            settings
                .filter
                .as_deref()
                .map_or(true, |filter| object.contains(filter))
        })
        .collect();
    info!(count = candidates.len(), "disks found after filter");
    debug!(?candidates, "candidate storage objects");

    let mut groups: Vec<DiskGroup> = Vec::new();
    for object in &candidates {
        let Some(disk) = classifier.classify(object).await? else {
            continue;
        };

        let index = match groups.iter().position(|group| group.id == disk.entity_id) {
            Some(index) => index,
            None => {
                groups.push(DiskGroup::new(
                    disk.entity_id.clone(),
                    disk.info.kind,
                    disk.last_config.clone(),
                ));
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        if config_sort_key(&disk.last_config) > config_sort_key(&group.config_file) {
            group.config_file = disk.last_config.clone();
        }
        group
            .insert(Disk::BackedUp(disk))
            .map_err(|e| DiscoveryError::classification(object.as_str(), format!("{:#}", e)))?;
    }

    for group in &mut groups {
        group.config = classifier.load_config(&group.config_file).await?.clone();
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_name() {
        let parsed = parse_object_name("vm-100-disk-2").unwrap();
        assert_eq!(parsed.prefix, "vm");
        assert_eq!(parsed.entity_id, "100");
        assert_eq!(parsed.disk_number, 2);
        assert_eq!(parse_object_name("subvol-101-disk-0").unwrap().entity_id, "101");
        assert_eq!(parse_object_name("basevol-9000-disk-1").unwrap().prefix, "basevol");
        assert!(parse_object_name("vm-100-state-snap1").is_none());
        assert!(parse_object_name("vm-abc-disk-0").is_none());
        assert!(parse_object_name("replica").is_none());
    }

    #[test]
    fn test_config_sort_key_orders_by_timestamp() {
        let older = "100.conf.qemu.rep_daily_2024-01-01_23:59:59";
        let newer = "100.conf.qemu.rep_daily_2024-01-02_00:00:01";
        assert!(config_sort_key(newer) > config_sort_key(older));
        assert!(config_sort_key("no-timestamp").0.is_none());
    }

    #[test]
    fn test_matching_config_files() {
        let files: Vec<String> = [
            "100.conf.qemu.rep_daily_2024-01-01_00:00:01",
            "100.conf.qemu.rep_daily_2024-01-02_00:00:01",
            "1000.conf.qemu.rep_daily_2024-01-02_00:00:01",
            "101.conf.lxc.rep_daily_2024-01-02_00:00:01",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let matches = matching_config_files(&files, "100", "rep_daily_2024-01-02_00:00:01");
        assert_eq!(matches, ["100.conf.qemu.rep_daily_2024-01-02_00:00:01"]);

        let matches = matching_config_files(&files, "100", "rep_daily");
        assert_eq!(
            matches,
            [
                "100.conf.qemu.rep_daily_2024-01-02_00:00:01",
                "100.conf.qemu.rep_daily_2024-01-01_00:00:01"
            ]
        );
    }

    #[test]
    fn test_disk_volume_single_match() {
        let config = PveConfig::parse("scsi0: local-zfs:vm-100-disk-0,size=32G\nscsi1: local-zfs:vm-100-disk-10,size=1G\n");
        assert_eq!(
            disk_volume(config.current(), "tank/replica/vm-100-disk-0").unwrap(),
            "local-zfs:vm-100-disk-0"
        );
    }

    #[test]
    fn test_disk_volume_ambiguous_uses_storage_segment() {
        let config = PveConfig::parse(
            "scsi0: local-zfs:vm-100-disk-0,size=32G\nscsi1: fast:vm-100-disk-0,size=8G\n",
        );
        assert_eq!(
            disk_volume(config.current(), "tank/replica/fast/vm-100-disk-0").unwrap(),
            "fast:vm-100-disk-0"
        );
    }

    #[test]
    fn test_disk_volume_missing() {
        let config = PveConfig::parse("scsi0: local-zfs:vm-100-disk-0,size=32G\n");
        let err = disk_volume(config.current(), "tank/replica/vm-100-disk-1").unwrap_err();
        assert!(matches!(err, DiscoveryError::Classification { .. }));
    }
}
