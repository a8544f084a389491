//! Transcript store: append-only log of conversation turns
//!
//! A transcript file belongs to the session that last started fresh on it.
//! Starting fresh discards whatever was there; resuming keeps the entries and
//! numbering continues after the highest `turnIndex`.

mod memory;
mod sqlite;
mod yaml;

pub use memory::MemoryTranscript;
pub use sqlite::SqliteTranscript;
pub use yaml::YamlTranscript;

use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use crate::knowledge::BackendKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqx_core::{
    next_turn_index, SessionId, TranscriptEntry, TranscriptRole, TranscriptSession,
    CURRENT_SCHEMA_VERSION,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Decoded contents of one transcript file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLog {
    pub schema_version: u32,
    /// Session that owns the file. Legacy files have none.
    pub session_id: Option<SessionId>,
    pub entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn empty() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: None,
            entries: Vec::new(),
        }
    }
}

/// Uniform access to one transcript file
pub trait TranscriptBackend: Send + Sync {
    fn path(&self) -> &Path;

    /// `None` when nothing has been written yet
    fn load(&self) -> Result<Option<TranscriptLog>>;

    /// Locked read-modify-write; a missing file starts from an empty log.
    /// Writes back only when `change` returns `true`.
    fn mutate(
        &self,
        op: Operation,
        change: &mut dyn FnMut(&mut TranscriptLog) -> bool,
    ) -> Result<TranscriptLog>;

    /// Hand an existing file to `session_id` with no entries. A missing file
    /// stays missing; an unreadable one is replaced.
    fn reset(&self, session_id: SessionId) -> Result<()> {
        match self.load() {
            Ok(None) => return Ok(()),
            Ok(Some(_)) | Err(StoreError::Corrupt { .. }) => {}
            Err(e) => return Err(e),
        }
        self.mutate(Operation::StartSession, &mut |log: &mut TranscriptLog| {
            log.entries.clear();
            log.session_id = Some(session_id);
            true
        })?;
        Ok(())
    }

    /// Append one turn with the next `turnIndex`
    fn append_entry(
        &self,
        session_id: SessionId,
        role: TranscriptRole,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<TranscriptEntry> {
        let mut stored = None;
        self.mutate(Operation::AppendTranscript, &mut |log: &mut TranscriptLog| {
            let entry = TranscriptEntry {
                turn_index: next_turn_index(&log.entries),
                role,
                content: content.to_string(),
                at,
            };
            log.session_id.get_or_insert(session_id);
            log.entries.push(entry.clone());
            stored = Some(entry);
            true
        })?;
        stored.ok_or_else(|| StoreError::corrupt(self.path(), "append produced no entry"))
    }
}

/// Open the transcript at `path` with the backend its suffix selects
pub fn open_transcript(path: &Path, config: &StoreConfig) -> Arc<dyn TranscriptBackend> {
    match BackendKind::for_path(path) {
        BackendKind::Sqlite => Arc::new(SqliteTranscript::new(path, *config)),
        BackendKind::Yaml => Arc::new(YamlTranscript::new(path, *config)),
    }
}

/// Read every entry at `path` in turn order
pub fn read_transcript(path: &Path, config: &StoreConfig) -> Result<Vec<TranscriptEntry>> {
    Ok(open_transcript(path, config)
        .load()?
        .map(|log| log.entries)
        .unwrap_or_default())
}

// ============================================================================
// Session registry
// ============================================================================

struct SessionHandle {
    backend: Arc<dyn TranscriptBackend>,
    resumed: bool,
}

/// Sessions started by this process, keyed by id
pub struct TranscriptStore {
    config: StoreConfig,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl TranscriptStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn start_session(&self, path: &Path, resume: bool) -> Result<SessionId> {
        self.start_session_with(open_transcript(path, &self.config), resume)
    }

    /// Start a session on an already opened backend
    pub fn start_session_with(
        &self,
        backend: Arc<dyn TranscriptBackend>,
        resume: bool,
    ) -> Result<SessionId> {
        let id = if resume {
            let existing = backend.load()?;
            existing.and_then(|log| log.session_id).unwrap_or_else(Uuid::new_v4)
        } else {
            let id = Uuid::new_v4();
            backend.reset(id)?;
            id
        };

        tracing::debug!(
            session = %id,
            path = %backend.path().display(),
            resume,
            "transcript session started"
        );
        self.sessions
            .write()
            .insert(id, SessionHandle { backend, resumed: resume });
        Ok(id)
    }

    fn backend(&self, id: SessionId) -> Result<Arc<dyn TranscriptBackend>> {
        self.sessions
            .read()
            .get(&id)
            .map(|h| Arc::clone(&h.backend))
            .ok_or(StoreError::UnknownSession(id))
    }

    pub fn path_of(&self, id: SessionId) -> Result<PathBuf> {
        Ok(self.backend(id)?.path().to_path_buf())
    }

    /// Append a turn stamped now. Blank content is not recorded.
    pub fn append(
        &self,
        id: SessionId,
        role: TranscriptRole,
        content: &str,
    ) -> Result<Option<TranscriptEntry>> {
        self.append_at(id, role, content, Utc::now())
    }

    pub fn append_at(
        &self,
        id: SessionId,
        role: TranscriptRole,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TranscriptEntry>> {
        let backend = self.backend(id)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        backend.append_entry(id, role, content, at).map(Some)
    }

    /// The session as currently on disk
    pub fn session(&self, id: SessionId) -> Result<TranscriptSession> {
        let (backend, resumed) = {
            let sessions = self.sessions.read();
            let handle = sessions.get(&id).ok_or(StoreError::UnknownSession(id))?;
            (Arc::clone(&handle.backend), handle.resumed)
        };
        let entries = backend.load()?.map(|log| log.entries).unwrap_or_default();
        Ok(TranscriptSession {
            session_id: id,
            resumed,
            entries,
        })
    }

    pub fn read_all(&self, path: &Path) -> Result<Vec<TranscriptEntry>> {
        read_transcript(path, &self.config)
    }
}

// ============================================================================
// Legacy (v1) conversion
// ============================================================================

/// Legacy turns in file order. `system` turns and invalid rows are skipped.
pub(crate) fn upgrade_legacy_turns<'a>(
    path: &Path,
    turns: impl Iterator<Item = (Option<&'a str>, Option<&'a str>, Option<&'a str>)>,
) -> Vec<TranscriptEntry> {
    let mut entries = Vec::new();
    for (index, (role, content, ts)) in turns.enumerate() {
        let role = match role.map(|r| r.parse::<TranscriptRole>()) {
            Some(Ok(role)) => role,
            _ => {
                tracing::warn!(path = %path.display(), index, role = ?role, "legacy turn skipped");
                continue;
            }
        };
        let Some(content) = content.map(str::trim).filter(|c| !c.is_empty()) else {
            tracing::warn!(path = %path.display(), index, "legacy turn with blank content skipped");
            continue;
        };
        let Some(at) = ts.and_then(crate::versioned::parse_legacy_ts) else {
            tracing::warn!(path = %path.display(), index, "legacy turn with bad timestamp skipped");
            continue;
        };
        entries.push(TranscriptEntry {
            turn_index: next_turn_index(&entries),
            role,
            content: content.to_string(),
            at,
        });
    }
    entries
}
