//! Named advisory locks backed by `<protected path><suffix>` files.
//!
//! Uses OS file locks (`flock` on Unix, `LockFileEx` on Windows), so a lock
//! excludes other threads and other processes alike, on the same host or
//! on any host sharing a filesystem that honours advisory locks.
//!
//! Each [`LockManager`] also tracks which of its locks the current thread
//! holds: asking for the same lock twice on one thread would block forever
//! on the OS lock, so it is rejected with [`Error::LockReentry`] instead.

use std::collections::HashSet;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

type Owner = (PathBuf, ThreadId);

/// Hands out exclusive locks keyed by the path they protect.
#[derive(Debug, Clone)]
pub struct LockManager {
    suffix: String,
    timeout: Option<Duration>,
    retry_interval: Duration,
    held: Arc<Mutex<HashSet<Owner>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self {
            suffix: ".lock".to_string(),
            timeout: None,
            retry_interval: Duration::from_millis(10),
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl LockManager {
    /// Blocking locks with no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up with [`Error::LockTimeout`] after `timeout`. `None` blocks forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Path of the lock file guarding `protected`.
    pub fn lock_path(&self, protected: &Path) -> PathBuf {
        let mut name = protected.as_os_str().to_owned();
        name.push(&self.suffix);
        PathBuf::from(name)
    }

    /// Block until the lock for `protected` is free, then take it.
    ///
    /// The lock is released when the returned guard is dropped, so it is
    /// released on every exit path of the protected section.
    pub fn acquire(&self, protected: &Path) -> Result<LockGuard> {
        let path = self.lock_path(protected);
        let owner = (path.clone(), thread::current().id());

        if !self.held_set().insert(owner.clone()) {
            return Err(Error::LockReentry { path });
        }

        match self.lock_file(&path) {
            Ok((file, waited)) => {
                let waited_ms = waited.as_secs_f64() * 1000.0;
                metrics::lock_wait_ms().record(
                    waited_ms,
                    &[KeyValue::new("lock", path.display().to_string())],
                );
                debug!(lock = %path.display(), waited_ms, "lock acquired");
                Ok(LockGuard {
                    file: Some(file),
                    owner,
                    held: Arc::clone(&self.held),
                })
            }
            Err(e) => {
                self.held_set().remove(&owner);
                Err(e)
            }
        }
    }

    fn lock_file(&self, path: &Path) -> Result<(File, Duration)> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| Error::LockFile {
                path: path.to_path_buf(),
                source,
            })?;

        let start = Instant::now();
        let Some(timeout) = self.timeout else {
            file.lock().map_err(|source| Error::LockFile {
                path: path.to_path_buf(),
                source,
            })?;
            return Ok((file, start.elapsed()));
        };

        loop {
            match file.try_lock() {
                Ok(()) => return Ok((file, start.elapsed())),
                Err(TryLockError::WouldBlock) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        warn!(lock = %path.display(), ?waited, "lock wait timed out");
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    thread::sleep(self.retry_interval.min(timeout - waited));
                }
                Err(TryLockError::Error(source)) => {
                    return Err(Error::LockFile {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
    }

    fn held_set(&self) -> std::sync::MutexGuard<'_, HashSet<Owner>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An acquired lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    owner: Owner,
    held: Arc<Mutex<HashSet<Owner>>>,
}

impl LockGuard {
    /// Path of the lock file (not the protected file).
    pub fn path(&self) -> &Path {
        &self.owner.0
    }

    /// Release now. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(e) = file.unlock() {
            // Closing the descriptor below releases the lock regardless.
            debug!(lock = %self.owner.0.display(), "explicit unlock failed: {e}");
        }
        drop(file);
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.owner);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Liveness marker for one driver run.
///
/// The run holds an exclusive OS lock on `<input>.run-<id>` until it is
/// dropped. Any process can then tell whether the run that claimed a task is
/// still alive by trying the same lock with [`RunLease::is_live`].
#[derive(Debug)]
pub struct RunLease {
    id: String,
    path: PathBuf,
    file: Option<File>,
}

impl RunLease {
    pub fn lease_path(input: &Path, id: &str) -> PathBuf {
        let mut name = input.as_os_str().to_owned();
        name.push(format!(".run-{id}"));
        PathBuf::from(name)
    }

    /// Take the lease for run `id` over `input`.
    ///
    /// Fails with [`Error::LockReentry`] if the lease is already held.
    pub fn acquire(input: &Path, id: &str) -> Result<Self> {
        let path = Self::lease_path(input, id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| Error::LockFile {
                path: path.clone(),
                source,
            })?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(Error::LockReentry { path }),
            Err(TryLockError::Error(source)) => return Err(Error::LockFile { path, source }),
        }
        debug!(lease = %path.display(), "run lease acquired");
        Ok(Self {
            id: id.to_string(),
            path,
            file: Some(file),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether run `id` over `input` still holds its lease.
    ///
    /// A lease file left behind by a dead run is removed.
    pub fn is_live(input: &Path, id: &str) -> Result<bool> {
        let path = Self::lease_path(input, id);
        let file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(Error::LockFile { path, source }),
        };
        match file.try_lock() {
            Ok(()) => {
                drop(file);
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(lease = %path.display(), "stale lease not removed: {e}");
                }
                Ok(false)
            }
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(source)) => Err(Error::LockFile { path, source }),
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Removed while still locked so a liveness check never sees a free lease file.
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(lease = %self.path.display(), "lease file not removed: {e}");
        }
        drop(file);
    }
}
