//! Atomic file replacement
//!
//! Content is staged in a temp file next to the target (same directory, so
//! the final rename never crosses filesystems), flushed to disk, then renamed
//! over the target. Readers see the old file or the new one, never a mix.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Bytes staged on disk but not yet visible at the target path.
///
/// Dropping a `StagedWrite` without calling [`StagedWrite::commit`] removes
/// the temp file and leaves the target untouched.
pub struct StagedWrite {
    target: PathBuf,
    temp: NamedTempFile,
}

impl StagedWrite {
    pub fn stage(target: &Path, bytes: &[u8]) -> io::Result<Self> {
        let dir = parent_dir(target);
        fs::create_dir_all(dir)?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{name}.{}.", std::process::id()))
            .suffix(".tmp")
            .tempfile_in(dir)?;

        temp.write_all(bytes)?;
        temp.flush()?;
        temp.as_file().sync_all()?;

        Ok(Self {
            target: target.to_path_buf(),
            temp,
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Rename the staged file over the target
    pub fn commit(self) -> io::Result<()> {
        let dir = parent_dir(&self.target).to_path_buf();
        self.temp.persist(&self.target).map_err(|e| e.error)?;
        sync_dir(&dir);
        Ok(())
    }
}

/// Stage and commit in one step
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    StagedWrite::stage(target, bytes)?.commit()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Makes the rename itself durable. Not all filesystems allow it.
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory fsync skipped");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
