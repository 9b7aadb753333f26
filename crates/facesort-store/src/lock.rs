//! Advisory write lock for a registry file.
//!
//! Serializes writers across processes via `flock(2)` on a sidecar
//! `<registry>.lock` file. The lock is released when the guard drops, on
//! every exit path. Platforms without `flock` get no lock at all; atomic
//! rename still keeps the registry file intact, but concurrent writers can
//! then lose each other's updates.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// What to do when the advisory lock cannot be taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Log a warning and write unlocked (last writer wins).
    #[default]
    BestEffort,
    /// Refuse to write without the lock.
    Required,
}

impl std::str::FromStr for LockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(Self::BestEffort),
            "required" => Ok(Self::Required),
            other => Err(format!("unknown lock policy: {other} (expected best_effort or required)")),
        }
    }
}

/// Held exclusive lock on a registry's sidecar lock file.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    /// Path of the sidecar lock file guarding `target`.
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        target.with_file_name(name)
    }

    /// Block until the exclusive lock for `target` is held.
    ///
    /// Returns `Ok(None)` on platforms without advisory locking.
    pub fn acquire(target: &Path) -> io::Result<Option<Self>> {
        let path = Self::lock_path(target);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Self::lock_file(file, path)
    }

    #[cfg(unix)]
    fn lock_file(file: File, path: PathBuf) -> io::Result<Option<Self>> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        loop {
            // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                tracing::trace!(path = %path.display(), "registry lock acquired");
                return Ok(Some(Self { file, path }));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    #[cfg(not(unix))]
    fn lock_file(_file: File, path: PathBuf) -> io::Result<Option<Self>> {
        tracing::debug!(path = %path.display(), "advisory locking not supported on this platform");
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still open; `file` is closed after this.
            let result = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            if result != 0 {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %io::Error::last_os_error(),
                    "failed to release registry lock"
                );
            }
        }
    }
}
