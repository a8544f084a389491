//! Reqx Session: the conversation loop and the collaborator-facing service
//!
//! ```text
//!   InputSource ──► SessionController ──┬─► reserved command ──► stores / drafter
//!                     (state machine)   │
//!                                       └─► free text ──► ReplyModel ──► TagExtractor
//!                                                                          │
//!                                              knowledge store ◄── items ──┤
//!                                              transcript      ◄── turns ──┘
//! ```
//!
//! [`CoreService`] exposes the same operations one call at a time for
//! callers that keep no session (HTTP handlers, agent tools).

pub mod controller;
pub mod service;

#[cfg(test)]
mod tests;

pub use controller::{
    parse_command, ChatContext, ChatTurn, Command, InputSource, Outcome, SessionController,
    SessionState, HELP_TEXT,
};
pub use service::CoreService;

use reqx_core::DEFAULT_TAG;
use reqx_storage::{
    open_knowledge, open_transcript, BackendKind, ErrorKind, KnowledgeBackend, MemoryKnowledge,
    MemoryTranscript, StoreConfig, StoreError, TranscriptBackend,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Everything needed to open one interactive session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub knowledge_path: PathBuf,
    pub transcript_path: PathBuf,
    /// Continue the transcript instead of starting it fresh
    #[serde(default)]
    pub resume: bool,
    /// Redirect every store mutation to memory for the whole session
    #[serde(default)]
    pub dry_run: bool,
    /// Marker tag for embedded knowledge blocks
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

impl SessionConfig {
    pub fn new(knowledge_path: impl Into<PathBuf>, transcript_path: impl Into<PathBuf>) -> Self {
        Self {
            knowledge_path: knowledge_path.into(),
            transcript_path: transcript_path.into(),
            resume: false,
            dry_run: false,
            tag: default_tag(),
            store: StoreConfig::default(),
        }
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a [`ReplyModel`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model call failed: {0}")]
    Failed(String),
    #[error("no scripted reply left")]
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session has exited; input is no longer accepted")]
    Exited,
}

impl SessionError {
    /// Store error class, `None` for session-level errors
    pub fn store_kind(&self) -> Option<ErrorKind> {
        match self {
            SessionError::Store(e) => Some(e.kind()),
            SessionError::Exited => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

// ============================================================================
// Model seam
// ============================================================================

/// Produces the assistant's reply for the current conversation.
///
/// Implementations own transport, authentication, and retries. The
/// controller only sees text or a [`ModelError`].
pub trait ReplyModel {
    fn reply(&mut self, context: &ChatContext<'_>) -> std::result::Result<String, ModelError>;
}

/// Replays a fixed list of replies in order
#[derive(Debug, Clone, Default)]
pub struct ScriptedReplies {
    replies: std::collections::VecDeque<String>,
}

impl ScriptedReplies {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.replies.len()
    }
}

impl ReplyModel for ScriptedReplies {
    fn reply(&mut self, _context: &ChatContext<'_>) -> std::result::Result<String, ModelError> {
        self.replies.pop_front().ok_or(ModelError::Exhausted)
    }
}

// ============================================================================
// Dry-run wiring
// ============================================================================

/// Knowledge backend for `path`; in dry-run mode a memory copy of what is on
/// disk right now.
pub fn knowledge_backend(
    path: &Path,
    config: &StoreConfig,
    dry_run: bool,
) -> std::result::Result<Arc<dyn KnowledgeBackend>, StoreError> {
    let disk = open_knowledge(path, config);
    if !dry_run {
        return Ok(disk);
    }
    let snapshot = match disk.read() {
        Ok(snapshot) => snapshot,
        Err(StoreError::Corrupt { reason, .. }) if quarantines(path) => {
            tracing::warn!(path = %path.display(), %reason, "dry run: knowledge file unreadable");
            return Ok(Arc::new(MemoryKnowledge::damaged(path, reason)));
        }
        Err(e) => return Err(e),
    };
    tracing::debug!(path = %path.display(), items = snapshot.items.len(), "dry run: knowledge snapshot");
    Ok(Arc::new(MemoryKnowledge::seeded(path, snapshot)))
}

/// Transcript backend for `path`, with the same dry-run rule
pub fn transcript_backend(
    path: &Path,
    config: &StoreConfig,
    dry_run: bool,
) -> std::result::Result<Arc<dyn TranscriptBackend>, StoreError> {
    let disk = open_transcript(path, config);
    if !dry_run {
        return Ok(disk);
    }
    let snapshot = match disk.load() {
        Ok(snapshot) => snapshot,
        Err(StoreError::Corrupt { reason, .. }) if quarantines(path) => {
            tracing::warn!(path = %path.display(), %reason, "dry run: transcript file unreadable");
            return Ok(Arc::new(MemoryTranscript::damaged(path, reason)));
        }
        Err(e) => return Err(e),
    };
    Ok(Arc::new(MemoryTranscript::seeded(path, snapshot)))
}

/// Flat-file stores replace an unparseable file on the next write; SQLite
/// stores keep refusing it.
fn quarantines(path: &Path) -> bool {
    BackendKind::for_path(path) == BackendKind::Yaml
}
