//! Upgradable advisory lock over the cache's `config` file.
//!
//! Ported from fcntl record locks as used throughout the datastore layer
//! (see `ProcessLocker`); this variant additionally supports a shared lock
//! that upgrades in place to exclusive, since the cache opens in shared
//! mode and only a writer needs to upgrade.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Error};

use ccache_types::CacheError;

/// fcntl upgrade is not atomic on Linux (it's release-then-acquire under
/// the hood), so a contended upgrade is retried with backoff before giving
/// up. Chosen to bound worst-case latency under contention to ~1s.
const UPGRADE_ATTEMPTS: u32 = 10;
const UPGRADE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A lock that starts out shared or exclusive and can be upgraded
/// shared -> exclusive in place.
pub struct UpgradableLock {
    file: std::fs::File,
    path: PathBuf,
    exclusive: bool,
    released: bool,
}

impl UpgradableLock {
    /// Acquires a shared lock on `path`, creating the file if necessary.
    pub fn new_shared<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::new(path, libc::F_RDLCK, false)
    }

    /// Acquires an exclusive lock on `path` directly.
    pub fn new_exclusive<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::new(path, libc::F_WRLCK, true)
    }

    fn new<P: AsRef<Path>>(path: P, ltype: libc::c_int, exclusive: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if let Err(err) = try_lock(&file, ltype) {
            bail!("unable to lock {:?}: {}", path, err);
        }

        Ok(UpgradableLock {
            file,
            path,
            exclusive,
            released: false,
        })
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to upgrade a shared lock to exclusive. A no-op if already
    /// exclusive. Retries a bounded number of times on contention before
    /// surfacing `LockUpgradeFailed`.
    pub fn upgrade(&mut self) -> Result<(), CacheError> {
        if self.exclusive {
            return Ok(());
        }

        for attempt in 0..UPGRADE_ATTEMPTS {
            match try_lock(&self.file, libc::F_WRLCK) {
                Ok(()) => {
                    self.exclusive = true;
                    return Ok(());
                }
                Err(_) if attempt + 1 < UPGRADE_ATTEMPTS => {
                    std::thread::sleep(UPGRADE_RETRY_DELAY);
                }
                Err(_) => {
                    return Err(CacheError::LockUpgradeFailed {
                        path: self.path.clone(),
                    });
                }
            }
        }

        Err(CacheError::LockUpgradeFailed {
            path: self.path.clone(),
        })
    }

    /// Releases the lock. Idempotent; safe to call more than once, and
    /// always runs again (as a no-op) on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        let op = libc::flock {
            l_type: libc::F_UNLCK as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        if let Err(err) =
            nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op))
        {
            log::warn!("failed to release lock on {:?}: {}", self.path, err);
        }
        self.released = true;
    }
}

impl Drop for UpgradableLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_lock(file: &std::fs::File, ltype: libc::c_int) -> Result<(), nix::Error> {
    let op = libc::flock {
        l_type: ltype as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op))?;
    Ok(())
}

#[test]
fn test_shared_then_upgrade() {
    let mut path = std::env::temp_dir();
    path.push(format!("ccache-lock-test-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let mut lock = UpgradableLock::new_shared(&path).unwrap();
    assert!(!lock.is_exclusive());
    lock.upgrade().unwrap();
    assert!(lock.is_exclusive());
    lock.release();

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_upgrade_already_exclusive_is_noop() {
    let mut path = std::env::temp_dir();
    path.push(format!("ccache-lock-test-excl-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let mut lock = UpgradableLock::new_exclusive(&path).unwrap();
    assert!(lock.is_exclusive());
    lock.upgrade().unwrap();
    assert!(lock.is_exclusive());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_release_is_idempotent() {
    let mut path = std::env::temp_dir();
    path.push(format!("ccache-lock-test-release-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let mut lock = UpgradableLock::new_shared(&path).unwrap();
    lock.release();
    lock.release();

    let _ = std::fs::remove_file(&path);
}
