//! Named advisory file locks.
//!
//! Every write-path critical section is bounded by locks under
//! `.lattice/locks/<key>.lock`. Multi-key acquisition sorts keys
//! lexicographically and acquires in that order; the total order is what
//! prevents deadlock between concurrent writers holding any subset.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Default lock timeout in seconds
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;

/// Retry interval when waiting for a contended lock
const LOCK_RETRY_INTERVAL_MS: u64 = 50;

/// Lock key for a task's event log.
pub fn events_key(task_id: &str) -> String {
    format!("events_{task_id}")
}

/// Lock key for a task's snapshot.
pub fn tasks_key(task_id: &str) -> String {
    format!("tasks_{task_id}")
}

/// Lock key for the aggregate lifecycle log.
pub const LIFECYCLE_KEY: &str = "events__lifecycle";

/// Lock key for the short-id index.
pub const IDS_KEY: &str = "ids";

/// Lock key for one artifact's metadata and payload.
pub fn artifacts_key(artifact_id: &str) -> String {
    format!("artifacts_{artifact_id}")
}

/// Lock key for one named resource.
pub fn resource_key(name: &str) -> String {
    format!("resource_{name}")
}

fn is_lock_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    // On Windows, fs2/libc can surface lock/sharing violations as "Other".
    // Treat them as contention so callers get Err(LockTimeout) after timeout.
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        false
    }
}

/// A named advisory lock, released when dropped.
#[derive(Debug)]
pub struct LatticeLock {
    file: File,
    key: String,
}

impl LatticeLock {
    /// Acquire the lock for `key` under `locks_dir`, waiting up to `timeout`.
    pub fn acquire(locks_dir: &Path, key: &str, timeout: Duration) -> Result<Self> {
        let path = lock_path(locks_dir, key);
        fs::create_dir_all(locks_dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let start = Instant::now();
        let retry_interval = Duration::from_millis(LOCK_RETRY_INTERVAL_MS);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(key, "lock acquired");
                    return Ok(LatticeLock {
                        file,
                        key: key.to_string(),
                    });
                }
                Err(e) if is_lock_contended(&e) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockTimeout(key.to_string()));
                    }
                    std::thread::sleep(retry_interval);
                }
                Err(e) => {
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Try to acquire without waiting. `Ok(None)` means contended.
    pub fn try_acquire(locks_dir: &Path, key: &str) -> Result<Option<Self>> {
        let path = lock_path(locks_dir, key);
        fs::create_dir_all(locks_dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LatticeLock {
                file,
                key: key.to_string(),
            })),
            Err(e) if is_lock_contended(&e) => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LatticeLock {
    fn drop(&mut self) {
        // Unlock the file - ignore errors during drop
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(key = %self.key, "lock released");
    }
}

/// A set of locks acquired in sorted key order, released in reverse.
#[derive(Debug)]
pub struct MultiLock {
    locks: Vec<LatticeLock>,
}

impl MultiLock {
    /// Acquire all `keys`, deduplicated and sorted lexicographically.
    ///
    /// The timeout applies per lock; a failure releases everything already
    /// held before returning.
    pub fn acquire(locks_dir: &Path, keys: &[String], timeout: Duration) -> Result<Self> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut locks = Vec::with_capacity(sorted.len());
        for key in sorted {
            locks.push(LatticeLock::acquire(locks_dir, key, timeout)?);
        }

        Ok(MultiLock { locks })
    }

    /// Keys currently held, in acquisition order.
    pub fn keys(&self) -> Vec<&str> {
        self.locks.iter().map(|lock| lock.key()).collect()
    }
}

impl Drop for MultiLock {
    fn drop(&mut self) {
        while let Some(lock) = self.locks.pop() {
            drop(lock);
        }
    }
}

fn lock_path(locks_dir: &Path, key: &str) -> PathBuf {
    locks_dir.join(format!("{key}.lock"))
}
