// src/lock.rs

//! Exclusive process-level resource lock
//!
//! The whole filesystem-mutating pipeline runs under one exclusive file
//! lock. The guard releases the lock on every exit path, including panics,
//! via its `Drop` impl.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Held exclusive resource lock; released on drop
pub struct ResourceLock {
    file: fs::File,
}

impl ResourceLock {
    /// Try to take the lock without blocking
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired exclusive lock on {}", path.display());
                Ok(Some(Self { file }))
            }
            Err(_) => Ok(None),
        }
    }

    /// Take the lock, retrying for a bounded period before giving up
    pub fn acquire_with_timeout(path: &Path, attempts: u32, delay: Duration) -> Result<Option<Self>> {
        for attempt in 0..attempts {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            if attempt == 0 {
                warn!("waiting for exclusive lock on {}", path.display());
            }
            std::thread::sleep(delay);
        }
        Ok(None)
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!("failed to release resource lock: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resources.lock");

        let first = ResourceLock::try_acquire(&path).unwrap();
        assert!(first.is_some());

        // second holder in the same process is refused while held
        let second = ResourceLock::try_acquire(&path).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = ResourceLock::try_acquire(&path).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_acquire_with_timeout_gives_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resources.lock");

        let _held = ResourceLock::try_acquire(&path).unwrap().unwrap();
        let waited =
            ResourceLock::acquire_with_timeout(&path, 2, Duration::from_millis(10)).unwrap();
        assert!(waited.is_none());
    }
}
