//! Local storage (zfs) operations.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::exec::CommandRunner;

/// Local zfs command family
pub struct Zfs<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Zfs<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Whether a dataset or volume exists locally
    pub async fn exists(&self, dataset: &str) -> Result<bool> {
        if dataset.is_empty() {
            return Ok(false);
        }
        let output = self
            .runner
            .query(&["zfs", "list", "-H", "-o", "name", dataset])
            .await?;
        Ok(output.success())
    }

    /// Snapshots of `dataset` (full `dataset@name`), oldest first
    pub async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .query(&[
                "zfs", "list", "-t", "snapshot", "-H", "-o", "name", "-s", "creation", "-d", "1",
                dataset,
            ])
            .await?;
        output.check(&format!("listing snapshots of {}", dataset))?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Datasets and volumes directly below `parent`, excluding `parent`.
    /// Empty when `parent` cannot be listed.
    pub async fn list_children(&self, parent: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .query(&[
                "zfs", "list", "-H", "-o", "name", "-t", "filesystem,volume", "-d", "1", parent,
            ])
            .await?;
        if !output.success() {
            debug!(parent, stderr = %output.stderr.trim(), "cannot list children");
            return Ok(Vec::new());
        }
        let children: Vec<String> = output
            .lines()
            .filter(|name| *name != parent)
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    /// Short snapshot names present on `dataset`; empty if it does not exist
    pub async fn snapshot_names(&self, dataset: &str) -> Result<HashSet<String>> {
        if !self.exists(dataset).await? {
            return Ok(HashSet::new());
        }
        Ok(self
            .list_snapshots(dataset)
            .await?
            .iter()
            .filter_map(|snap| snapshot_suffix(snap))
            .map(str::to_string)
            .collect())
    }

    pub async fn destroy(&self, target: &str, recursive: bool) -> Result<()> {
        let output = if recursive {
            self.runner.execute(&["zfs", "destroy", "-r", target]).await?
        } else {
            self.runner.execute(&["zfs", "destroy", target]).await?
        };
        output.check(&format!("zfs destroy {}", target))
    }

    /// Stream `snapshot` (with descendants, raw) from the remote host into `destination`
    pub async fn replicate(&self, remote: &str, snapshot: &str, destination: &str) -> Result<()> {
        let script = format!(
            "ssh -o \"BatchMode yes\" {} zfs send -Rw {} | zfs recv -F {}",
            remote, snapshot, destination
        );
        let output = self.runner.execute_shell(&script).await?;
        // zfs recv can exit 0 after the sender failed, stderr is the reliable signal
        if !output.stderr.trim().is_empty() || !output.success() {
            bail!(
                "replicating {} to {} failed (exit {}): stdout: {:?} stderr: {:?}",
                snapshot,
                destination,
                output.code,
                output.stdout.trim(),
                output.stderr.trim()
            );
        }
        Ok(())
    }

    /// Roll back to `dataset@snapshot`, discarding newer snapshots
    pub async fn rollback(&self, dataset: &str, snapshot: &str) -> Result<()> {
        let target = format!("{}@{}", dataset, snapshot);
        self.runner
            .execute(&["zfs", "rollback", "-r", &target])
            .await?
            .check(&format!("zfs rollback {}", target))
    }

    pub async fn mount(&self, dataset: &str) -> Result<()> {
        self.runner
            .execute(&["zfs", "mount", dataset])
            .await?
            .check(&format!("zfs mount {}", dataset))
    }

    /// Destroy every snapshot on `dataset` created after `dataset@snapshot`.
    ///
    /// Returns the destroyed snapshots.
    pub async fn destroy_newer_snapshots(&self, dataset: &str, snapshot: &str) -> Result<Vec<String>> {
        let snapshots = self.list_snapshots(dataset).await?;
        let anchor = format!("{}@{}", dataset, snapshot);
        let newer = snapshots_after(&snapshots, &anchor)
            .with_context(|| format!("restore point {} not found", anchor))?;

        let mut destroyed = Vec::new();
        for snap in newer {
            info!(snapshot = %snap, "destroying newer snapshot");
            self.destroy(snap, false).await?;
            destroyed.push(snap.clone());
        }
        Ok(destroyed)
    }

    /// Whether `dataset` is encrypted. Unreadable properties count as unencrypted.
    pub async fn is_encrypted(&self, dataset: &str) -> bool {
        match self
            .runner
            .query(&["zfs", "get", "encryption", "-H", "-o", "value", dataset])
            .await
        {
            Ok(output) if output.success() => {
                let value = output.stdout.trim();
                !value.is_empty() && value != "off" && value != "-"
            }
            Ok(output) => {
                debug!(dataset, stderr = %output.stderr.trim(), "cannot read encryption property");
                false
            }
            Err(e) => {
                warn!(dataset, "cannot read encryption property: {:#}", e);
                false
            }
        }
    }

    pub async fn set_keylocation(&self, dataset: &str, keyfile: &Path) -> Result<()> {
        let property = format!("keylocation=file://{}", keyfile.display());
        self.runner
            .execute(&["zfs", "set", &property, dataset])
            .await?
            .check(&format!("zfs set keylocation on {}", dataset))
    }

    pub async fn load_key(&self, dataset: &str) -> Result<()> {
        self.runner
            .execute(&["zfs", "load-key", dataset])
            .await?
            .check(&format!("zfs load-key {}", dataset))
    }

    /// Make `dataset` inherit its encryption key from the parent
    pub async fn inherit_key(&self, dataset: &str) -> Result<()> {
        self.runner
            .execute(&["zfs", "change-key", "-i", dataset])
            .await?
            .check(&format!("zfs change-key -i {}", dataset))
    }
}

/// Name after `@` of a full snapshot identifier
pub fn snapshot_suffix(snapshot: &str) -> Option<&str> {
    snapshot.split_once('@').map(|(_, name)| name)
}

/// Parent dataset of `dataset`, if it has one
pub fn parent_dataset(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

/// Entries after `anchor` in a creation-ordered snapshot list
fn snapshots_after<'s>(snapshots: &'s [String], anchor: &str) -> Option<&'s [String]> {
    let index = snapshots.iter().position(|snap| snap == anchor)?;
    Some(&snapshots[index + 1..])
}

/// Parse size strings like "10G", "500M", "1024K", or plain bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty size string");
    }

    let (num_str, multiplier) = if s.ends_with('G') || s.ends_with('g') {
        (&s[..s.len() - 1], 1024u64 * 1024 * 1024)
    } else if s.ends_with('M') || s.ends_with('m') {
        (&s[..s.len() - 1], 1024u64 * 1024)
    } else if s.ends_with('K') || s.ends_with('k') {
        (&s[..s.len() - 1], 1024u64)
    } else {
        (s, 1u64)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("parsing size number '{}'", num_str))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("size '{}' out of range", s))
}
