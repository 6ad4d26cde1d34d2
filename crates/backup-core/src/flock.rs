//! Host-local advisory file locks capping how many backup jobs run at once
//! on one node.
//!
//! The lock is a `flock(2)` on a plain file. Acquisition never blocks in the
//! kernel: a busy lock is retried every `retry_interval` until `timeout`
//! elapses. Lock files are created if missing and never removed.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{BackupError, Result};

/// Picks `<dir>/<n>.lock` with `n` uniformly drawn from `1..=count`, so at
/// most `count` jobs sharing `dir` hold a lock at the same time.
pub fn shuffle_lock_file(dir: impl AsRef<Path>, count: usize) -> PathBuf {
    let n = rand::rng().random_range(1..=count.max(1));
    dir.as_ref().join(format!("{n}.lock"))
}

/// Half the available cores, at least one.
pub fn default_lock_count() -> usize {
    lock_count_for(std::thread::available_parallelism())
}

fn lock_count_for(parallelism: io::Result<std::num::NonZeroUsize>) -> usize {
    match parallelism {
        Ok(n) => (n.get() / 2).max(1),
        Err(e) => {
            warn!(error = %e, "Could not determine available parallelism");
            1
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_secs(2),
            retry_interval: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock. In dry-run mode nothing is opened and the returned
    /// guard is a no-op.
    ///
    /// Fails with [`BackupError::LockTimeout`] if the lock stayed busy until
    /// the deadline and with [`BackupError::LockIo`] on any other error, which
    /// is not retried.
    pub async fn acquire(&self, dry_run: bool) -> Result<LockGuard> {
        if dry_run {
            info!(path = %self.path.display(), "Skipping flock - dry run mode is active");
            return Ok(LockGuard { held: None });
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;

        let deadline = Instant::now() + self.timeout;

        loop {
            match try_lock_exclusive(&file) {
                Ok(()) => {
                    info!(path = %self.path.display(), "Got lock");
                    return Ok(LockGuard {
                        held: Some(HeldLock {
                            file,
                            path: self.path.clone(),
                        }),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(self.io_error(source)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BackupError::LockTimeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                });
            }

            debug!(path = %self.path.display(), "Lock busy, retrying");
            sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    fn io_error(&self, source: io::Error) -> BackupError {
        BackupError::LockIo {
            path: self.path.clone(),
            source,
        }
    }
}

#[derive(Debug)]
struct HeldLock {
    file: File,
    path: PathBuf,
}

/// Handle to an acquired lock. Released by [`LockGuard::release`] or, as a
/// fallback, on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    held: Option<HeldLock>,
}

impl LockGuard {
    /// True for dry-run guards and guards that were already released.
    pub fn is_noop(&self) -> bool {
        self.held.is_none()
    }

    /// Unlock and close the lock file. Calling it again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };

        // SAFETY: the descriptor belongs to `held.file`, which is open for the
        // whole call and closed only after it returns.
        let rc = unsafe { libc::flock(held.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(BackupError::LockIo {
                path: held.path,
                source: io::Error::last_os_error(),
            });
        }

        info!(path = %held.path.display(), "Released lock");
        // closing the descriptor happens when `held.file` drops here
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release lock on drop");
        }
    }
}

fn try_lock_exclusive(file: &File) -> io::Result<()> {
    // SAFETY: `file` is borrowed for the duration of the call, so its
    // descriptor stays valid; flock touches no memory we own.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
