//! Snapshot-metadata repair against a real configuration file.

mod common;

use common::{local_dataset, settings, write_vm_config, FakeRunner, VM_100_CONFIG};
use zsync_restore::hypervisor::EntityType;
use zsync_restore::plan::{BackedUpDisk, Disk, DiskGroup, DiskInfo, Disposition, NonBackedUpDisk};
use zsync_restore::restore::Repairer;

fn disk(name: &str, disposition: Disposition) -> Disk {
    Disk::BackedUp(BackedUpDisk {
        info: DiskInfo {
            unique_name: format!("local-zfs:{}", name),
            kind: EntityType::Vm,
            destination: format!("rpool/data/{}", name),
        },
        entity_id: "100".to_string(),
        object: format!("tank/replica/{}", name),
        last_snapshot: format!("tank/replica/{}@daily_2024-01-01", name),
        last_config: "100.conf.qemu.daily_2024-01-01".to_string(),
        disposition,
    })
}

fn group() -> DiskGroup {
    let mut group = DiskGroup::new("100", EntityType::Vm, "100.conf.qemu.daily_2024-01-01");
    group
        .insert(disk("vm-100-disk-0", Disposition::Restore))
        .unwrap();
    group
        .insert(disk("vm-100-disk-1", Disposition::Keep))
        .unwrap();
    group
}

fn scripted_runner() -> FakeRunner {
    let runner = FakeRunner::new();
    runner.respond(
        "qm listsnapshot 100",
        "`-> daily_2024-01-01  2024-01-01 00:00:00  no-description\n\
         \x20 `-> daily_2024-01-02  2024-01-02 00:00:00  no-description\n\
         \x20   `-> current  You are here!\n",
    );
    local_dataset(&runner, "rpool/data/vm-100-disk-0", &["daily_2024-01-01"]);
    local_dataset(
        &runner,
        "rpool/data/vm-100-disk-1",
        &["daily_2024-01-01", "daily_2024-01-02"],
    );
    runner
}

#[tokio::test]
async fn test_repair_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let path = write_vm_config(&settings, "100", VM_100_CONFIG);
    let runner = scripted_runner();
    let repairer = Repairer::new(&runner, false);
    let group = group();

    let first = repairer.repair(&group, &path).await.unwrap();
    assert_eq!(first.removed.len(), 1);
    assert_eq!(first.removed[0].snapshot, "daily_2024-01-02");
    assert_eq!(first.removed[0].disk, "local-zfs:vm-100-disk-0");
    assert_eq!(first.removed[0].slot, "scsi0");
    assert!(first.dead_snapshots.is_empty());

    let after_first = std::fs::read_to_string(&path).unwrap();
    let newest = after_first.split_once("[daily_2024-01-02]").unwrap().1;
    assert!(!newest.contains("vm-100-disk-0"));
    assert!(newest.contains("scsi1: local-zfs:vm-100-disk-1,size=8G"));

    let second = repairer.repair(&group, &path).await.unwrap();
    assert!(second.removed.is_empty());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), after_first);
}

#[tokio::test]
async fn test_dry_run_leaves_config_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let path = write_vm_config(&settings, "100", VM_100_CONFIG);
    let runner = scripted_runner();

    let outcome = Repairer::new(&runner, true)
        .repair(&group(), &path)
        .await
        .unwrap();
    assert_eq!(outcome.removed.len(), 1);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), VM_100_CONFIG);
}

#[tokio::test]
async fn test_missing_config_fails_repair_only() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_runner();
    let err = Repairer::new(&runner, false)
        .repair(&group(), &dir.path().join("missing.conf"))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("missing.conf"));
}

/// scsi2 was recreated; the hypervisor named the new volume disk-3, a name an
/// older snapshot still uses for a long gone disk
const RECREATED_CONFIG: &str = "\
boot: order=scsi0
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,size=8G
scsi2: local-zfs:vm-100-disk-3,size=4G
parent: daily_2024-01-02

[daily_2024-01-01]
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,size=8G
scsi3: local-zfs:vm-100-disk-3,size=2G
snaptime: 1704067200

[daily_2024-01-02]
parent: daily_2024-01-01
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,size=8G
scsi2: local-zfs:vm-100-disk-2,size=4G
snaptime: 1704153600
";

#[tokio::test]
async fn test_recreated_disk_is_repaired_under_its_allocated_name() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let path = write_vm_config(&settings, "100", RECREATED_CONFIG);
    let runner = scripted_runner();
    runner.respond("pvesm path local-zfs:vm-100-disk-3", "/dev/zvol/rpool/data/vm-100-disk-3\n");
    local_dataset(&runner, "rpool/data/vm-100-disk-3", &[]);

    let mut group = group();
    group
        .insert(Disk::NonBackedUp(NonBackedUpDisk {
            info: DiskInfo {
                unique_name: "local-zfs:vm-100-disk-2".to_string(),
                kind: EntityType::Vm,
                destination: "rpool/data/vm-100-disk-2".to_string(),
            },
            slot: "scsi2".to_string(),
            line: "local-zfs:vm-100-disk-2,size=4G".to_string(),
            present: false,
            recreate: true,
        }))
        .unwrap();

    let outcome = Repairer::new(&runner, false).repair(&group, &path).await.unwrap();
    let removed: Vec<(&str, &str)> = outcome
        .removed
        .iter()
        .map(|r| (r.snapshot.as_str(), r.disk.as_str()))
        .collect();
    assert_eq!(
        removed,
        [
            ("daily_2024-01-02", "local-zfs:vm-100-disk-0"),
            ("daily_2024-01-02", "local-zfs:vm-100-disk-2"),
            ("daily_2024-01-01", "local-zfs:vm-100-disk-3"),
        ]
    );
    assert!(outcome.dead_snapshots.is_empty());

    let text = std::fs::read_to_string(&path).unwrap();
    let (current, snapshots) = text.split_once("[daily_2024-01-01]").unwrap();
    assert!(current.contains("scsi2: local-zfs:vm-100-disk-3,size=4G"));
    assert!(!snapshots.contains("vm-100-disk-3"));
    assert!(!snapshots.contains("vm-100-disk-2"));
}
