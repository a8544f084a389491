//! In-memory transcript backend

use super::{TranscriptBackend, TranscriptLog};
use crate::error::{Operation, Result, StoreError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// Transcript held in process memory, standing in for `path`
pub struct MemoryTranscript {
    path: PathBuf,
    state: Mutex<Option<TranscriptLog>>,
    damaged: Mutex<Option<String>>,
}

impl MemoryTranscript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::seeded(path, None)
    }

    /// `snapshot` is what the real file held, `None` if it did not exist
    pub fn seeded(path: impl Into<PathBuf>, snapshot: Option<TranscriptLog>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(snapshot),
            damaged: Mutex::new(None),
        }
    }

    /// Stand in for a transcript that failed to parse; cleared by the first
    /// mutation
    pub fn damaged(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        let memory = Self::new(path);
        *memory.damaged.lock() = Some(reason.into());
        memory
    }
}

impl TranscriptBackend for MemoryTranscript {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<TranscriptLog>> {
        if let Some(reason) = self.damaged.lock().as_deref() {
            return Err(StoreError::corrupt(&self.path, reason));
        }
        Ok(self.state.lock().clone())
    }

    fn mutate(
        &self,
        _op: Operation,
        change: &mut dyn FnMut(&mut TranscriptLog) -> bool,
    ) -> Result<TranscriptLog> {
        let mut state = self.state.lock();
        self.damaged.lock().take();
        let mut log = state.clone().unwrap_or_else(TranscriptLog::empty);
        if change(&mut log) {
            *state = Some(log.clone());
        }
        Ok(log)
    }
}
