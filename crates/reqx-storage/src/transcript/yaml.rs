//! YAML transcript backend

use super::{upgrade_legacy_turns, TranscriptBackend, TranscriptLog};
use crate::atomic::write_atomic;
use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use crate::lock::FileLock;
use crate::versioned::{
    ensure_supported, peek_yaml_version, quarantine, read_optional, LEGACY_SCHEMA_VERSION,
};
use reqx_core::{SessionId, TranscriptEntry, CURRENT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct TranscriptFile {
    schema_version: u32,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    entries: Vec<EntryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    turn_index: u64,
    role: reqx_core::TranscriptRole,
    content: String,
    at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct LegacyFile {
    #[serde(default)]
    turns: Vec<LegacyTurn>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyTurn {
    role: serde_yaml::Value,
    content: serde_yaml::Value,
    ts: serde_yaml::Value,
}

/// Transcript in a single YAML file
pub struct YamlTranscript {
    path: PathBuf,
    config: StoreConfig,
}

impl YamlTranscript {
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    fn decode(&self, text: &str) -> Result<TranscriptLog> {
        if text.trim().is_empty() {
            return Ok(TranscriptLog::empty());
        }
        let version = peek_yaml_version(&self.path, text)?.unwrap_or(LEGACY_SCHEMA_VERSION);
        ensure_supported(&self.path, version)?;

        if version >= CURRENT_SCHEMA_VERSION {
            let file: TranscriptFile =
                serde_yaml::from_str(text).map_err(|e| StoreError::corrupt(&self.path, e))?;
            return Ok(TranscriptLog {
                schema_version: file.schema_version,
                session_id: file.session_id,
                entries: file
                    .entries
                    .into_iter()
                    .map(|r| TranscriptEntry {
                        turn_index: r.turn_index,
                        role: r.role,
                        content: r.content,
                        at: r.at,
                    })
                    .collect(),
            });
        }

        let legacy: LegacyFile =
            serde_yaml::from_str(text).map_err(|e| StoreError::corrupt(&self.path, e))?;
        let turns = legacy
            .turns
            .iter()
            .map(|t| (t.role.as_str(), t.content.as_str(), t.ts.as_str()));
        Ok(TranscriptLog {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: None,
            entries: upgrade_legacy_turns(&self.path, turns),
        })
    }

    fn encode(&self, op: Operation, log: &TranscriptLog) -> Result<Vec<u8>> {
        let file = TranscriptFile {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: log.session_id,
            entries: log
                .entries
                .iter()
                .map(|e| EntryRecord {
                    turn_index: e.turn_index,
                    role: e.role,
                    content: e.content.clone(),
                    at: e.at,
                })
                .collect(),
        };
        serde_yaml::to_string(&file)
            .map(String::into_bytes)
            .map_err(|e| StoreError::encode(&self.path, op, e))
    }
}

impl TranscriptBackend for YamlTranscript {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<TranscriptLog>> {
        match read_optional(&self.path)? {
            Some(text) => self.decode(&text).map(Some),
            None => Ok(None),
        }
    }

    fn mutate(
        &self,
        op: Operation,
        change: &mut dyn FnMut(&mut TranscriptLog) -> bool,
    ) -> Result<TranscriptLog> {
        let _lock = FileLock::acquire(&self.path, &self.config)?;

        let mut log = match self.load() {
            Ok(log) => log.unwrap_or_else(TranscriptLog::empty),
            Err(StoreError::Corrupt { .. }) => {
                quarantine(&self.path)?;
                TranscriptLog::empty()
            }
            Err(e) => return Err(e),
        };

        if !change(&mut log) {
            return Ok(log);
        }
        let bytes = self.encode(op, &log)?;
        write_atomic(&self.path, &bytes).map_err(|e| StoreError::io(&self.path, op, e))?;
        tracing::debug!(path = %self.path.display(), %op, entries = log.entries.len(), "transcript written");
        Ok(log)
    }
}
