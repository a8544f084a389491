//! Flat-file YAML knowledge backend

use super::{legacy_record, upgrade_legacy, KnowledgeBackend};
use crate::atomic::write_atomic;
use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use crate::lock::FileLock;
use crate::versioned::{
    ensure_supported, peek_yaml_version, quarantine, read_optional, LEGACY_SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};
use reqx_core::{KnowledgeItem, ProjectKnowledge, Role, SpecDocument, CURRENT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk layout, version 2. `schema_version` is serialized first so it can
/// be peeked without parsing the rest.
#[derive(Debug, Serialize, Deserialize)]
struct KnowledgeFile {
    schema_version: u32,
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    latest_spec: Option<SpecDocument>,
    #[serde(default)]
    items: Vec<ItemRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemRecord {
    sequence: u64,
    role: Role,
    text: String,
    added_at: DateTime<Utc>,
}

/// Version 1 layout. Fields are read loosely so one bad record does not
/// poison the file.
#[derive(Debug, Deserialize)]
struct LegacyFile {
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    latest_spec_yaml: Option<String>,
    #[serde(default)]
    records: Vec<LegacyRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyRecord {
    role: serde_yaml::Value,
    content: serde_yaml::Value,
    ts: serde_yaml::Value,
}

impl From<&ProjectKnowledge> for KnowledgeFile {
    fn from(k: &ProjectKnowledge) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            project_name: k.project_name.clone(),
            latest_spec: k.latest_spec.clone(),
            items: k
                .items
                .iter()
                .map(|i| ItemRecord {
                    sequence: i.sequence,
                    role: i.role,
                    text: i.text.clone(),
                    added_at: i.added_at,
                })
                .collect(),
        }
    }
}

impl From<KnowledgeFile> for ProjectKnowledge {
    fn from(f: KnowledgeFile) -> Self {
        Self {
            schema_version: f.schema_version,
            project_name: f.project_name,
            latest_spec: f.latest_spec,
            items: f
                .items
                .into_iter()
                .map(|r| KnowledgeItem {
                    role: r.role,
                    text: r.text,
                    sequence: r.sequence,
                    added_at: r.added_at,
                })
                .collect(),
        }
    }
}

/// Knowledge store in a single YAML file
pub struct YamlKnowledge {
    path: PathBuf,
    config: StoreConfig,
}

impl YamlKnowledge {
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    fn decode(&self, text: &str) -> Result<ProjectKnowledge> {
        if text.trim().is_empty() {
            return Ok(ProjectKnowledge::empty());
        }
        let version = peek_yaml_version(&self.path, text)?.unwrap_or(LEGACY_SCHEMA_VERSION);
        ensure_supported(&self.path, version)?;

        if version >= CURRENT_SCHEMA_VERSION {
            let file: KnowledgeFile =
                serde_yaml::from_str(text).map_err(|e| StoreError::corrupt(&self.path, e))?;
            return Ok(file.into());
        }

        let legacy: LegacyFile =
            serde_yaml::from_str(text).map_err(|e| StoreError::corrupt(&self.path, e))?;
        let records = legacy
            .records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                legacy_record(
                    &self.path,
                    i,
                    r.role.as_str(),
                    r.content.as_str(),
                    r.ts.as_str(),
                )
            })
            .collect();
        tracing::debug!(path = %self.path.display(), "legacy knowledge file upgraded in memory");
        Ok(upgrade_legacy(
            legacy.project_name.as_deref(),
            legacy.latest_spec_yaml.as_deref(),
            records,
        ))
    }

    fn encode(&self, op: Operation, knowledge: &ProjectKnowledge) -> Result<Vec<u8>> {
        serde_yaml::to_string(&KnowledgeFile::from(knowledge))
            .map(String::into_bytes)
            .map_err(|e| StoreError::encode(&self.path, op, e))
    }
}

impl KnowledgeBackend for YamlKnowledge {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ProjectKnowledge> {
        match read_optional(&self.path)? {
            Some(text) => self.decode(&text),
            None => Ok(ProjectKnowledge::empty()),
        }
    }

    fn mutate(
        &self,
        op: Operation,
        change: &mut dyn FnMut(&mut ProjectKnowledge) -> bool,
    ) -> Result<ProjectKnowledge> {
        let _lock = FileLock::acquire(&self.path, &self.config)?;

        let mut knowledge = match self.read() {
            Ok(k) => k,
            Err(StoreError::Corrupt { .. }) => {
                quarantine(&self.path)?;
                ProjectKnowledge::empty()
            }
            Err(e) => return Err(e),
        };

        if !change(&mut knowledge) {
            return Ok(knowledge);
        }

        let bytes = self.encode(op, &knowledge)?;
        write_atomic(&self.path, &bytes).map_err(|e| StoreError::io(&self.path, op, e))?;
        tracing::debug!(
            path = %self.path.display(),
            %op,
            items = knowledge.items.len(),
            "knowledge written"
        );
        Ok(knowledge)
    }
}
