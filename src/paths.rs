use std::path::{Path, PathBuf};

/// Root of the hypervisor's clustered configuration filesystem
pub fn default_pve_root() -> PathBuf {
    PathBuf::from("/etc/pve")
}

/// Directory holding host lock files
pub fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock/zsync-restore")
}

/// Directory of container configuration files
pub fn container_config_dir(pve_root: &Path) -> PathBuf {
    pve_root.join("lxc")
}

/// Directory of VM configuration files
pub fn vm_config_dir(pve_root: &Path) -> PathBuf {
    pve_root.join("qemu-server")
}

/// Lock file for a replication source host
pub fn host_lock_file(lock_dir: &Path, host: &str) -> PathBuf {
    let safe: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    lock_dir.join(format!("{}.lock", safe))
}
