use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::paths;

#[derive(Parser, Debug)]
#[command(
    name = "zsync-restore",
    version,
    about = "Restore VMs and containers from replicated storage snapshots"
)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Log mutating commands instead of executing them
    #[arg(long, short = 't', global = true)]
    pub dry_run: bool,

    /// Print step details
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Trace every command and log its captured output
    #[arg(long, short, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore disks from a replication target back onto this host
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Host holding the replicated pool
    #[arg(long, short = 'H')]
    pub hostname: String,

    /// Storage pool on the remote host to restore from
    #[arg(long = "zfs-source-pool", short = 'p')]
    pub source_pool: String,

    /// Backup tag contained in the snapshot names to restore
    #[arg(long = "backupname", short = 'b')]
    pub backup_name: String,

    /// Remote directory of point-in-time configuration files
    #[arg(long = "config-path", short = 'c', default_value = "/var/lib/pve-zsync")]
    pub config_path: String,

    /// Only consider storage objects whose name contains this string
    #[arg(long, short = 'f')]
    pub filter: Option<String>,

    /// Key file for encrypted datasets
    #[arg(long, short = 'k')]
    pub keyfile: Option<PathBuf>,

    /// Remote ssh user
    #[arg(long, default_value = "root")]
    pub ssh_user: String,

    /// Hypervisor configuration root
    #[arg(long, default_value_os_t = paths::default_pve_root())]
    pub pve_root: PathBuf,

    /// Directory for host lock files
    #[arg(long, default_value_os_t = paths::default_lock_dir())]
    pub lock_dir: PathBuf,

    /// Print the restore report as JSON
    #[arg(long)]
    pub json: bool,
}
