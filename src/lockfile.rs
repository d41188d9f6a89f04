//! Advisory lock serializing concurrent provisioning runs.
//!
//! A user can re-run the interactive installer while the background job is
//! still provisioning; without serialization both orchestrators would race
//! on the same install trees. The lock is a PID-stamped file under the log
//! root: the second invocation logs and exits cleanly, and a lock left by a
//! dead process is broken.

use crate::error::{BasecampError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for the lifetime of one orchestrator run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock at `path`, breaking it if the holder is dead.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());

                match holder {
                    Some(pid) if pid != std::process::id() && pid_alive(pid) => {
                        Err(BasecampError::LockHeld {
                            path: path.to_path_buf(),
                            pid,
                        })
                    }
                    // Stale (dead holder, our own pid, or unreadable stamp):
                    // break and take over.
                    _ => {
                        fs::remove_file(path)?;
                        Self::try_create(path).map_err(BasecampError::Io)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Whether a process with this PID is currently alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without signaling. EPERM still means
    // the process exists.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a cheap liveness probe, assume the holder is alive; the job
/// scheduler's execution ceiling bounds how long a wedged holder can block.
#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_pid_stamped_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");

        let lock = RunLock::acquire(&path).unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn drop_releases_lock() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");

        {
            let _lock = RunLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn held_by_live_process_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");

        // PID 1 is always alive and never us.
        fs::write(&path, "1").unwrap();

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err, BasecampError::LockHeld { pid: 1, .. }));
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_is_broken() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");

        // A PID far above any default pid_max.
        fs::write(&path, "999999999").unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn unreadable_stamp_is_broken() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");
        fs::write(&path, "not-a-pid").unwrap();

        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn own_pid_stamp_is_reacquired() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();

        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn acquire_creates_missing_parent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deep/nested/setup.lock");
        let lock = RunLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }
}
