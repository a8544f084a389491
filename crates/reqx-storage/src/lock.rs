//! Cross-process advisory lock on a `<file>.lock` sidecar

use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Exclusive lock held for the lifetime of the guard
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Sidecar path guarding `target`
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        target.with_file_name(name)
    }

    /// Poll for the lock on `target` until `config.lock_timeout` elapses
    pub fn acquire(target: &Path, config: &StoreConfig) -> Result<Self> {
        let path = Self::lock_path(target);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(&path, Operation::Lock, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, Operation::Lock, e))?;

        let deadline = Instant::now() + config.lock_timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "lock acquired");
                    return Ok(Self { file, path });
                }
                Err(e) if is_contended(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(path = %path.display(), "lock timed out");
                        return Err(StoreError::Concurrency {
                            path: target.to_path_buf(),
                            timeout_ms: config.timeout_ms(),
                        });
                    }
                    std::thread::sleep(config.lock_poll_interval.min(deadline - now));
                }
                Err(e) => return Err(StoreError::io(&path, Operation::Lock, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
