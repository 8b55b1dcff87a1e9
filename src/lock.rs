//! Host-scoped restore lock.
//!
//! One exclusive `flock` per backup host, held for the whole run. The lock is
//! released by [`HostLock::release`] or, on early exits, when dropped.

use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::paths;

#[derive(Debug)]
pub struct HostLock {
    path: PathBuf,
    flock: Option<Flock<File>>,
}

impl HostLock {
    /// Block until the lock for `host` is ours
    pub fn acquire(lock_dir: &Path, host: &str) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("creating lock directory {}", lock_dir.display()))?;

        let path = paths::host_lock_file(lock_dir, host);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        debug!(path = %path.display(), "waiting for host lock");
        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, err)| err)
            .with_context(|| format!("acquiring host lock {}", path.display()))?;
        info!(host, path = %path.display(), "host lock acquired");

        Ok(Self {
            path,
            flock: Some(flock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        if let Some(flock) = self.flock.take() {
            flock
                .unlock()
                .map_err(|(_, err)| err)
                .with_context(|| format!("releasing host lock {}", self.path.display()))?;
            info!(path = %self.path.display(), "host lock released");
        }
        Ok(())
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        if let Some(flock) = self.flock.take() {
            let _ = flock.unlock();
            debug!(path = %self.path.display(), "host lock released on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock = HostLock::acquire(dir.path(), "backup.example").unwrap();
        assert!(lock.path().exists());

        let contender = OpenOptions::new().write(true).open(lock.path()).unwrap();
        let busy = Flock::lock(contender, FlockArg::LockExclusiveNonblock);
        let contender = match busy {
            Ok(_) => panic!("lock should be held"),
            Err((file, _)) => file,
        };

        lock.release().unwrap();
        assert!(Flock::lock(contender, FlockArg::LockExclusiveNonblock).is_ok());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = HostLock::acquire(dir.path(), "backup").unwrap();
        }
        let again = HostLock::acquire(dir.path(), "backup").unwrap();
        again.release().unwrap();
    }
}
