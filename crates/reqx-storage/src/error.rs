//! Storage errors

use reqx_core::SessionId;
use std::fmt;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, StoreError>;

/// The store operation that was running when an error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Append,
    SetProjectName,
    SetLatestSpec,
    StartSession,
    AppendTranscript,
    Lock,
    Quarantine,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Read => "read",
            Operation::Append => "append",
            Operation::SetProjectName => "setProjectName",
            Operation::SetLatestSpec => "setLatestSpec",
            Operation::StartSession => "startSession",
            Operation::AppendTranscript => "appendTranscript",
            Operation::Lock => "lock",
            Operation::Quarantine => "quarantine",
        })
    }
}

/// Coarse error classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lock or database busy past the timeout. Retrying may succeed.
    Concurrency,
    /// I/O, SQLite, encoding, or a corrupt payload
    Storage,
    /// The file was written by a newer build
    SchemaVersion,
    UnknownSession,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out after {timeout_ms}ms waiting for exclusive access to {}", path.display())]
    Concurrency { path: PathBuf, timeout_ms: u64 },

    #[error("{operation} failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        operation: Operation,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed on {}: {source}", path.display())]
    Sqlite {
        path: PathBuf,
        operation: Operation,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{operation} failed on {}: could not encode: {reason}", path.display())]
    Encode {
        path: PathBuf,
        operation: Operation,
        reason: String,
    },

    #[error("corrupt payload in {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("{} has schema version {found}; this build supports up to {supported}", path.display())]
    SchemaVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("unknown transcript session {0}")]
    UnknownSession(SessionId),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Concurrency { .. } => ErrorKind::Concurrency,
            StoreError::Io { .. }
            | StoreError::Sqlite { .. }
            | StoreError::Encode { .. }
            | StoreError::Corrupt { .. } => ErrorKind::Storage,
            StoreError::SchemaVersion { .. } => ErrorKind::SchemaVersion,
            StoreError::UnknownSession(_) => ErrorKind::UnknownSession,
        }
    }

    pub(crate) fn io(path: &Path, operation: Operation, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            operation,
            source,
        }
    }

    /// SQLite errors, with busy/locked folded into [`StoreError::Concurrency`]
    pub(crate) fn sqlite(
        path: &Path,
        operation: Operation,
        timeout_ms: u64,
        source: rusqlite::Error,
    ) -> Self {
        match source.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Concurrency {
                    path: path.to_path_buf(),
                    timeout_ms,
                }
            }
            _ => StoreError::Sqlite {
                path: path.to_path_buf(),
                operation,
                source,
            },
        }
    }

    pub(crate) fn encode(path: &Path, operation: Operation, reason: impl fmt::Display) -> Self {
        StoreError::Encode {
            path: path.to_path_buf(),
            operation,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl fmt::Display) -> Self {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
