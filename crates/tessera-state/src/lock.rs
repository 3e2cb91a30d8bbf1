use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::StateError;

/// Tuning for the per-key directory lock
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// A lock directory older than this is considered abandoned
    pub stale_after: Duration,
    /// Attempts before giving up with `LockTimeout`
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            stale_after: Duration::from_secs(10),
            max_attempts: 100,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(250),
        }
    }
}

/// Cross-process exclusive lock on one storage key.
///
/// Acquiring creates `<hex key>.lock` inside the storage directory; creating a
/// directory either succeeds or fails atomically, so only one holder can win.
/// Dropping the guard removes the directory.
#[derive(Debug)]
pub struct KeyLock {
    path: PathBuf,
    name: String,
}

impl KeyLock {
    pub fn new(dir: &Path, key: &[u8]) -> Self {
        let name = hex::encode(key);
        KeyLock {
            path: dir.join(format!("{}.lock", name)),
            name,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(self, config: &LockConfig) -> Result<KeyLockGuard, StateError> {
        let mut backoff = config.initial_backoff;

        for attempt in 0..config.max_attempts {
            match tokio::fs::create_dir(&self.path).await {
                Ok(()) => {
                    if attempt > 0 {
                        debug!("Acquired lock {} after {} attempts", self.name, attempt + 1);
                    }
                    return Ok(KeyLockGuard { path: self.path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale(config.stale_after).await {
                        warn!("Evicting stale lock {}", self.name);
                        match tokio::fs::remove_dir(&self.path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StateError::LockTimeout(self.name))
    }

    async fn is_stale(&self, stale_after: Duration) -> bool {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified(),
            Err(_) => return false,
        };
        match modified {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > stale_after)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct KeyLockGuard {
    path: PathBuf,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to release lock {:?}: {}", self.path, e);
            }
        }
    }
}
