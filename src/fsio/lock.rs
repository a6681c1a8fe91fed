//! Advisory per-file locks.
//!
//! A lock is a file created with `O_EXCL` under `.morfx/locks/` next to the
//! target. Writers must hold the lock for the duration of a single commit
//! phase; the guard releases it on every exit path.

use crate::error::{MorfxError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// An advisory lock on a target file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Acquires the lock for `target`, retrying with exponential backoff
    /// until `timeout` elapses.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = Self::lock_path_for(target)?;
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    // Owner pid, for operators inspecting stuck locks.
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { lock_path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() + backoff > deadline {
                        return Err(MorfxError::LockTimeout {
                            path: target.to_path_buf(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Where the lock file for `target` lives.
    pub fn lock_path_for(target: &Path) -> Result<PathBuf> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let basename = target
            .file_name()
            .ok_or_else(|| MorfxError::FileNotFound(target.to_path_buf()))?
            .to_string_lossy();
        Ok(dir
            .join(super::MORFX_DIR)
            .join("locks")
            .join(format!("{basename}.lock")))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.go");
        std::fs::write(&target, b"x").unwrap();

        let lock_path = FileLock::lock_path_for(&target).unwrap();
        {
            let _lock = FileLock::acquire(&target, Duration::from_secs(1)).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.go");
        std::fs::write(&target, b"x").unwrap();

        let _held = FileLock::acquire(&target, Duration::from_secs(1)).unwrap();
        let second = FileLock::acquire(&target, Duration::from_millis(50));
        match second {
            Err(MorfxError::LockTimeout { path, .. }) => assert_eq!(path, target),
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_reacquire_after_release() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.go");
        std::fs::write(&target, b"x").unwrap();

        drop(FileLock::acquire(&target, Duration::from_secs(1)).unwrap());
        let again = FileLock::acquire(&target, Duration::from_millis(100));
        assert!(again.is_ok());
    }
}
