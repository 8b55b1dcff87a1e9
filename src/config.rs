//! Run configuration.
//!
//! [`Settings`] is built once from the command line and passed by reference
//! to every component.

use std::path::PathBuf;

use crate::cli::{GlobalArgs, RestoreArgs};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Replication target host holding the backup pool
    pub host: String,
    pub ssh_user: String,
    /// Storage pool on `host` containing the replicated objects
    pub source_pool: String,
    /// Tag that selects which historical snapshots are eligible
    pub backup_name: String,
    /// Remote directory of point-in-time configuration files
    pub config_path: String,
    pub filter: Option<String>,
    pub keyfile: Option<PathBuf>,
    pub pve_root: PathBuf,
    pub lock_dir: PathBuf,
    pub dry_run: bool,
    /// Log the captured output of every external command
    pub debug: bool,
    pub json: bool,
}

impl Settings {
    pub fn from_args(globals: &GlobalArgs, args: RestoreArgs) -> Self {
        Self {
            host: args.hostname,
            ssh_user: args.ssh_user,
            source_pool: args.source_pool,
            backup_name: args.backup_name,
            config_path: args.config_path.trim_end_matches('/').to_string(),
            filter: args.filter,
            keyfile: args.keyfile,
            pve_root: args.pve_root,
            lock_dir: args.lock_dir,
            dry_run: globals.dry_run,
            debug: globals.debug,
            json: args.json,
        }
    }

    /// `user@host` for ssh/scp
    pub fn remote(&self) -> String {
        format!("{}@{}", self.ssh_user, self.host)
    }

    /// Full remote path of a point-in-time configuration file
    pub fn remote_config_file(&self, name: &str) -> String {
        format!("{}/{}", self.config_path, name)
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        host: "backup".to_string(),
        ssh_user: "root".to_string(),
        source_pool: "tank/replica".to_string(),
        backup_name: "daily".to_string(),
        config_path: "/var/lib/pve-zsync".to_string(),
        filter: None,
        keyfile: None,
        pve_root: crate::paths::default_pve_root(),
        lock_dir: crate::paths::default_lock_dir(),
        dry_run: false,
        debug: false,
        json: false,
    }
}
