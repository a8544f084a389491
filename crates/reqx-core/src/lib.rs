//! Reqx Core: decisions from conversation, specs from decisions
//!
//! This crate holds the pure, I/O-free half of the requirement-excavation
//! pipeline:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        REQX CORE PIPELINE                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  model reply ──► TagExtractor ──► display text (to the user)         │
//! │                       │                                              │
//! │                       └──────► AppendItem[] ──► knowledge store      │
//! │                                                                      │
//! │  ProjectKnowledge ──► SpecDrafter ──► raw JSON ──► normalize()       │
//! │                                                       │              │
//! │                                                       ▼              │
//! │                                                 SpecDocument         │
//! │                                         (always complete, errors     │
//! │                                          in `validationErrors`)      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Persistence lives in `reqx-storage`; orchestration in `reqx-session`.

pub mod draft;
pub mod extraction;
pub mod spec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use draft::{KeyedItemDrafter, SpecDrafter};
pub use extraction::{Extraction, ExtractionWarning, TagExtractor, DEFAULT_TAG};
pub use spec::{normalize, normalize_at, SpecDocument, ValidationWarning, PROMPT_VERSION};

// ============================================================================
// Versions
// ============================================================================

/// Schema version written by this build.
///
/// Version 1 is the legacy layout (`records` with `content`/`ts`); version 2
/// adds explicit sequences and the structured latest spec.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Unique identifier for a transcript session
pub type SessionId = Uuid;

// ============================================================================
// Roles
// ============================================================================

/// Who produced a knowledge item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role string is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Who spoke a transcript turn. Transcripts only record the two parties of
/// the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl TranscriptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranscriptRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(TranscriptRole::User),
            "assistant" => Ok(TranscriptRole::Assistant),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

// ============================================================================
// Knowledge
// ============================================================================

/// One extracted decision or fact, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    pub role: Role,
    pub text: String,
    pub sequence: u64,
    pub added_at: DateTime<Utc>,
}

/// An item waiting to be appended (no sequence or timestamp yet)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendItem {
    pub role: Role,
    pub text: String,
}

impl AppendItem {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// Build items sharing one role
    pub fn batch<S: AsRef<str>>(role: Role, texts: &[S]) -> Vec<AppendItem> {
        texts
            .iter()
            .map(|t| AppendItem::new(role, t.as_ref()))
            .collect()
    }
}

/// The persisted decision set plus project metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectKnowledge {
    pub schema_version: u32,
    pub project_name: Option<String>,
    pub items: Vec<KnowledgeItem>,
    /// Last document persisted by a `done` request
    pub latest_spec: Option<SpecDocument>,
}

impl Default for ProjectKnowledge {
    fn default() -> Self {
        Self::empty()
    }
}

impl ProjectKnowledge {
    /// The state of a store that has never been written
    pub fn empty() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            project_name: None,
            items: Vec::new(),
            latest_spec: None,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.items.iter().map(|i| i.sequence).max().unwrap_or(0) + 1
    }

    /// Append items in order, assigning increasing sequences.
    ///
    /// Text is trimmed and blank items are skipped. Returns the items that
    /// were actually added. Every backend routes its appends through here so
    /// sequence assignment is identical everywhere.
    pub fn append(&mut self, items: &[AppendItem], at: DateTime<Utc>) -> Vec<KnowledgeItem> {
        let mut next = self.next_sequence();
        let mut added = Vec::new();
        for item in items {
            let text = item.text.trim();
            if text.is_empty() {
                continue;
            }
            let stored = KnowledgeItem {
                role: item.role,
                text: text.to_string(),
                sequence: next,
                added_at: at,
            };
            next += 1;
            added.push(stored.clone());
            self.items.push(stored);
        }
        // A write always lands in the current layout.
        self.schema_version = self.schema_version.max(CURRENT_SCHEMA_VERSION);
        added
    }

    /// Set or clear the project name. Blank names clear it.
    pub fn set_project_name(&mut self, name: &str) {
        let name = name.trim();
        self.project_name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        self.schema_version = self.schema_version.max(CURRENT_SCHEMA_VERSION);
    }

    pub fn set_latest_spec(&mut self, spec: SpecDocument) {
        self.latest_spec = Some(spec);
        self.schema_version = self.schema_version.max(CURRENT_SCHEMA_VERSION);
    }

    /// Render items as `role: text` lines in sequence order
    pub fn transcript(&self) -> String {
        self.items
            .iter()
            .map(|i| format!("{}: {}", i.role, i.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// Transcripts
// ============================================================================

/// One persisted conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub turn_index: u64,
    pub role: TranscriptRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// A transcript as seen by one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSession {
    pub session_id: SessionId,
    pub resumed: bool,
    pub entries: Vec<TranscriptEntry>,
}

/// Next turn index after the given entries (1-based)
pub fn next_turn_index(entries: &[TranscriptEntry]) -> u64 {
    entries.iter().map(|e| e.turn_index).max().unwrap_or(0) + 1
}
