use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fd_lock::{RwLock, RwLockWriteGuard};

use crate::error::{MemoryErr, Result};

/// How long a waiter polls for the lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cross-process exclusive lock guarding the indexer.
///
/// Backed by an advisory file lock at `.engram/sync.lock`. Readers are
/// never blocked — only writers take this. The guard releases on drop,
/// so both the success and failure paths of a sync let the next writer
/// in without cleanup code.
pub struct SyncLock {
    path: PathBuf,
    inner: RwLock<File>,
}

impl SyncLock {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(file),
        })
    }

    /// Acquire the exclusive lock, polling up to `timeout`.
    ///
    /// Fails fast with `ConcurrencyDenied` once the budget is spent; a
    /// concurrent writer holding the lock for longer than the timeout is
    /// treated as a caller problem, not something to wait out forever.
    pub fn acquire(&mut self, timeout: Duration) -> Result<RwLockWriteGuard<'_, File>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_write() {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(MemoryErr::ConcurrencyDenied(self.path.clone()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.try_write().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        let mut lock = SyncLock::open(&path).unwrap();
        {
            let _guard = lock.acquire(Duration::from_millis(200)).unwrap();
        }
        // Released on drop — a second acquisition on the same handle works.
        let _guard = lock.acquire(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn second_handle_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        let mut holder = SyncLock::open(&path).unwrap();
        let _held = holder.acquire(Duration::from_millis(200)).unwrap();

        let mut waiter = SyncLock::open(&path).unwrap();
        let denied = waiter.acquire(Duration::from_millis(300));
        assert!(matches!(denied, Err(MemoryErr::ConcurrencyDenied(_))));
    }
}
