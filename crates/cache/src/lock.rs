//! Per-key advisory locks
//!
//! Serializes computation of one cache key across processes sharing a
//! `saved_data_path`. A lock is a file created with `create_new` whose
//! contents record `pid:acquired_at`. Locks older than the stale threshold
//! are broken, which recovers from holders that crashed without cleaning up.

use crate::{CacheKey, Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default lock acquisition timeout (5 minutes)
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default stale lock threshold (10 minutes)
pub const STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(600);

/// Lock acquisition poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Holder information stored in a lock file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Process ID that holds the lock
    pub pid: u32,
    /// Seconds since the epoch when the lock was taken
    pub acquired_at: u64,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: current_timestamp(),
        }
    }

    fn serialize(&self) -> String {
        format!("{}:{}", self.pid, self.acquired_at)
    }

    fn deserialize(s: &str) -> Option<Self> {
        let (pid, acquired_at) = s.trim().split_once(':')?;
        Some(Self {
            pid: pid.parse().ok()?,
            acquired_at: acquired_at.parse().ok()?,
        })
    }

    fn age(&self) -> Duration {
        Duration::from_secs(current_timestamp().saturating_sub(self.acquired_at))
    }
}

/// Per-key lock manager rooted at a lock directory
#[derive(Debug, Clone)]
pub struct KeyLock {
    lock_dir: PathBuf,
    timeout: Duration,
    stale_threshold: Duration,
}

impl KeyLock {
    /// Create a lock manager storing lock files in `lock_dir`
    #[must_use]
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            stale_threshold: STALE_LOCK_THRESHOLD,
        }
    }

    /// Set the acquisition timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the age after which a lock is considered abandoned
    #[must_use]
    pub const fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Acquisition timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Path of the lock file for `key`
    #[must_use]
    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", key.as_hex()))
    }

    /// Acquire the lock for `key`, waiting up to the configured timeout
    ///
    /// # Errors
    ///
    /// [`Error::LockTimeout`] if the lock stays held past the timeout
    pub async fn acquire(&self, key: &CacheKey) -> Result<KeyLockGuard> {
        fs::create_dir_all(&self.lock_dir)
            .map_err(|e| Error::io(e, &self.lock_dir, "create_dir_all"))?;

        let lock_path = self.lock_path(key);
        let start = Instant::now();

        loop {
            if let Some(guard) = self.try_acquire_at(&lock_path, key)? {
                return Ok(guard);
            }

            if start.elapsed() >= self.timeout {
                return Err(Error::LockTimeout {
                    key: key.as_hex().to_string(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }

            tracing::debug!(key = %key.short(), "Key locked by another worker, waiting");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Try once to take the lock for `key`
    ///
    /// Returns `Ok(None)` if another holder has it.
    pub fn try_acquire(&self, key: &CacheKey) -> Result<Option<KeyLockGuard>> {
        fs::create_dir_all(&self.lock_dir)
            .map_err(|e| Error::io(e, &self.lock_dir, "create_dir_all"))?;
        self.try_acquire_at(&self.lock_path(key), key)
    }

    /// Current holder of the lock for `key`, if any
    #[must_use]
    pub fn holder(&self, key: &CacheKey) -> Option<LockHolder> {
        read_holder(&self.lock_path(key))
    }

    fn try_acquire_at(&self, lock_path: &Path, key: &CacheKey) -> Result<Option<KeyLockGuard>> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                file.write_all(LockHolder::current().serialize().as_bytes())
                    .map_err(|e| Error::io(e, lock_path, "write"))?;
                tracing::trace!(key = %key.short(), "Acquired key lock");
                Ok(Some(KeyLockGuard {
                    lock_path: lock_path.to_path_buf(),
                    key: key.clone(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match read_holder(lock_path) {
                    Some(holder) if holder.age() > self.stale_threshold => {
                        tracing::warn!(
                            key = %key.short(),
                            holder_pid = holder.pid,
                            age_secs = holder.age().as_secs(),
                            "Breaking stale key lock"
                        );
                        let _ = fs::remove_file(lock_path);
                    }
                    Some(_) => {}
                    None => {
                        // Holder may be between create and write; treat as held unless the
                        // file itself is old
                        if file_age(lock_path).is_some_and(|age| age > self.stale_threshold) {
                            let _ = fs::remove_file(lock_path);
                        }
                    }
                }
                Ok(None)
            }
            Err(e) => Err(Error::io(e, lock_path, "create_lock")),
        }
    }
}

/// Guard that releases the key lock when dropped
#[derive(Debug)]
pub struct KeyLockGuard {
    lock_path: PathBuf,
    key: CacheKey,
}

impl KeyLockGuard {
    /// Key this guard protects
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(key = %self.key.short(), error = %e, "Failed to release key lock");
            }
        } else {
            tracing::trace!(key = %self.key.short(), "Released key lock");
        }
    }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let contents = fs::read_to_string(path).ok()?;
    LockHolder::deserialize(&contents)
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
