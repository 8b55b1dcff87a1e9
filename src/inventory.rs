//! Read-only queries against the replication target host.

use anyhow::Result;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::exec::{ssh_argv, CommandOutput, CommandRunner};

pub struct RemoteInventory<'a> {
    runner: &'a dyn CommandRunner,
    host: &'a str,
    /// `user@host`
    remote: String,
}

impl<'a> RemoteInventory<'a> {
    pub fn new(runner: &'a dyn CommandRunner, user: &str, host: &'a str) -> Self {
        Self {
            runner,
            host,
            remote: format!("{}@{}", user, host),
        }
    }

    async fn run(&self, remote_argv: &[&str]) -> Result<CommandOutput> {
        let argv = ssh_argv(&self.remote, remote_argv);
        let output = self.runner.query(&argv).await?;
        if !output.success() {
            return Err(DiscoveryError::RemoteCommand {
                host: self.host.to_string(),
                command: remote_argv.join(" "),
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    /// All storage objects on the host, after confirming `pool` exists
    pub async fn list_storage_objects(&self, pool: &str) -> Result<Vec<String>> {
        let unavailable = |reason: String| DiscoveryError::RemoteUnavailable {
            host: self.host.to_string(),
            pool: pool.to_string(),
            reason,
        };

        let argv = ssh_argv(&self.remote, &["zfs", "list", "-rH", "-o", "name"]);
        let output = self.runner.query(&argv).await?;
        if !output.success() || !output.stderr.trim().is_empty() {
            return Err(unavailable(output.stderr.trim().to_string()).into());
        }

        let objects: Vec<String> = output.lines().map(str::to_string).collect();
        if !objects.iter().any(|name| name == pool) {
            return Err(unavailable("pool not listed".to_string()).into());
        }

        debug!(host = %self.host, pool, count = objects.len(), "listed remote storage objects");
        Ok(objects)
    }

    /// Historical snapshots of `object`, oldest first
    pub async fn list_snapshots(&self, object: &str) -> Result<Vec<String>> {
        let output = self
            .run(&["zfs", "list", "-t", "snapshot", "-H", "-o", "name", "-s", "creation", object])
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    pub async fn read_remote_file(&self, path: &str) -> Result<String> {
        Ok(self.run(&["cat", path]).await?.stdout)
    }

    /// File names in a remote directory
    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let output = self.run(&["ls", "-1", path]).await?;
        Ok(output.lines().map(str::to_string).collect())
    }
}
