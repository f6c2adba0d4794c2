//! Host-local named locks.
//!
//! A key maps to `<lock_dir>/<key>`, held with `flock(2)` so separate driver
//! processes on one host exclude each other. Tasks inside this process queue on
//! a per-key async mutex first, since `flock` on separate descriptors from the
//! same process would not block on every platform.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Clone)]
pub struct NamedLocks {
    lock_dir: PathBuf,
    local: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            local: Arc::new(DashMap::new()),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn image_key(image_ref: &str) -> String {
        format!("lxd-image-{image_ref}")
    }

    pub fn snapshot_key(instance_name: &str) -> String {
        format!("lxd-snapshot-{instance_name}")
    }

    /// Block until `key` is held by this caller.
    pub async fn acquire(&self, key: &str) -> io::Result<NamedLockGuard> {
        let file_name = sanitize(key);
        let mutex = self
            .local
            .entry(file_name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let local = mutex.lock_owned().await;

        let path = self.lock_dir.join(&file_name);
        let dir = self.lock_dir.clone();
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            std::fs::create_dir_all(&dir)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(file)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        debug!(lock = %file_name, "Acquired named lock");
        Ok(NamedLockGuard {
            name: file_name,
            file,
            _local: local,
        })
    }
}

/// Lock file names may not contain path separators.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

/// Releases the file lock, then the in-process mutex, when dropped.
pub struct NamedLockGuard {
    name: String,
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        // SAFETY: `self.file` is still open; closing it would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(lock = %self.name, "Released named lock");
    }
}
