//! In-memory knowledge backend

use super::KnowledgeBackend;
use crate::error::{Operation, Result, StoreError};
use parking_lot::Mutex;
use reqx_core::ProjectKnowledge;
use std::path::{Path, PathBuf};

/// Knowledge held in process memory. Reports the path it stands in for but
/// never touches it.
pub struct MemoryKnowledge {
    path: PathBuf,
    state: Mutex<ProjectKnowledge>,
    /// Parse failure of the file this stands in for, until the first mutation
    damaged: Mutex<Option<String>>,
}

impl MemoryKnowledge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::seeded(path, ProjectKnowledge::empty())
    }

    /// Start from a snapshot, typically the on-disk contents at session start
    pub fn seeded(path: impl Into<PathBuf>, snapshot: ProjectKnowledge) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(snapshot),
            damaged: Mutex::new(None),
        }
    }

    /// Stand in for a file that failed to parse. Reads report the corruption;
    /// the first mutation starts over from an empty store, as a file backend
    /// does after quarantining.
    pub fn damaged(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        let memory = Self::new(path);
        *memory.damaged.lock() = Some(reason.into());
        memory
    }
}

impl KnowledgeBackend for MemoryKnowledge {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ProjectKnowledge> {
        if let Some(reason) = self.damaged.lock().as_deref() {
            return Err(StoreError::corrupt(&self.path, reason));
        }
        Ok(self.state.lock().clone())
    }

    fn mutate(
        &self,
        _op: Operation,
        change: &mut dyn FnMut(&mut ProjectKnowledge) -> bool,
    ) -> Result<ProjectKnowledge> {
        let mut state = self.state.lock();
        self.damaged.lock().take();
        let mut next = state.clone();
        if change(&mut next) {
            *state = next.clone();
        }
        Ok(next)
    }
}
