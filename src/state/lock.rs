//! Advisory file locking, abstracted behind `try_acquire(timeout)` so the
//! rest of the StateStore doesn't need to know whether it's running on
//! POSIX `flock` or Windows `LockFileEx` — both are exposed uniformly by
//! `fs2::FileExt`, which only supports blocking or non-blocking acquisition,
//! so a timed acquisition is built by polling `try_lock_exclusive` with a
//! short sleep between attempts.

use crate::errors::StateError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Poll for an exclusive lock on `path` until `timeout` elapses.
    /// `timeout == Duration::ZERO` means "try once, fail immediately".
    pub fn try_acquire(path: &Path, timeout: Duration) -> Result<Self, StateError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| StateError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(StateError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())).max(Duration::from_millis(1)));
                }
                Err(source) => {
                    return Err(StateError::Write {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}
