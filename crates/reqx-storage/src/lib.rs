//! Reqx Storage: crash-safe persistence for knowledge and transcripts
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          REQX STORAGE                              │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                                                                    │
//! │   knowledge.yaml ──┐                        ┌── transcript.db      │
//! │                    ▼                        ▼                      │
//! │   ┌───────────────────────┐      ┌────────────────────────┐        │
//! │   │  KnowledgeBackend     │      │  TranscriptBackend     │        │
//! │   │  yaml │ sqlite │ mem  │      │  yaml │ sqlite │ mem   │        │
//! │   └───────────┬───────────┘      └───────────┬────────────┘        │
//! │               │                              │                     │
//! │               ▼                              ▼                     │
//! │   FileLock (<file>.lock)  +  StagedWrite (temp, fsync, rename)     │
//! │   or SQLite BEGIN IMMEDIATE                                        │
//! │                                                                    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Atomic**: a reader sees the previous file or the new one, never a mix
//! - **Serialized writers**: every mutation is a locked read-modify-write
//! - **Read-only reads**: reading never creates, migrates, or rewrites a file
//! - **Versioned**: older layouts upgrade on the next write; newer ones are refused

pub mod atomic;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod lock;
pub mod transcript;

mod sql;
mod versioned;

pub use atomic::{write_atomic, StagedWrite};
pub use config::StoreConfig;
pub use error::{ErrorKind, Operation, Result, StoreError};
pub use knowledge::{
    open_knowledge, BackendKind, KnowledgeBackend, MemoryKnowledge, SqliteKnowledge,
    YamlKnowledge,
};
pub use lock::FileLock;
pub use transcript::{
    open_transcript, read_transcript, MemoryTranscript, SqliteTranscript, TranscriptBackend,
    TranscriptLog, TranscriptStore, YamlTranscript,
};
