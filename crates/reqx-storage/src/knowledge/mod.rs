//! Knowledge store: the persisted decision set
//!
//! One contract, three backends:
//!
//! ```text
//!                     ┌──────────────────────┐
//!   open_knowledge ──►│  KnowledgeBackend    │  read / append / setProjectName
//!   (by suffix)       └──────────┬───────────┘  / setLatestSpec
//!            ┌───────────────────┼────────────────────┐
//!            ▼                   ▼                    ▼
//!      YamlKnowledge      SqliteKnowledge      MemoryKnowledge
//!      (lock + rename)    (BEGIN IMMEDIATE)    (dry runs, tests)
//! ```
//!
//! Every mutation is a read-modify-write through
//! [`KnowledgeBackend::mutate`], and the modification itself is always one of
//! the [`ProjectKnowledge`] methods, so sequence assignment cannot drift
//! between backends.

mod memory;
mod sqlite;
mod yaml;

pub use memory::MemoryKnowledge;
pub use sqlite::SqliteKnowledge;
pub use yaml::YamlKnowledge;

use crate::config::StoreConfig;
use crate::error::{Operation, Result};
use chrono::{DateTime, Utc};
use reqx_core::{normalize_at, AppendItem, ProjectKnowledge, Role, SpecDocument};
use std::path::Path;
use std::sync::Arc;

/// Physical layout of a store, chosen from the path suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Yaml,
    Sqlite,
}

impl BackendKind {
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("db") | Some("sqlite") | Some("sqlite3") => BackendKind::Sqlite,
            _ => BackendKind::Yaml,
        }
    }
}

/// Uniform access to one knowledge store
pub trait KnowledgeBackend: Send + Sync {
    fn path(&self) -> &Path;

    /// Current contents. A missing store reads as empty and is not created.
    fn read(&self) -> Result<ProjectKnowledge>;

    /// Atomically read, apply `change`, and write back if it returns `true`.
    /// Returns the state after the change. `change` must not depend on being
    /// called only once.
    fn mutate(
        &self,
        op: Operation,
        change: &mut dyn FnMut(&mut ProjectKnowledge) -> bool,
    ) -> Result<ProjectKnowledge>;

    fn append_items(&self, items: &[AppendItem], at: DateTime<Utc>) -> Result<ProjectKnowledge> {
        self.mutate(Operation::Append, &mut |k: &mut ProjectKnowledge| {
            !k.append(items, at).is_empty()
        })
    }

    fn append(&self, role: Role, texts: &[String]) -> Result<ProjectKnowledge> {
        self.append_items(&AppendItem::batch(role, texts), Utc::now())
    }

    fn set_project_name(&self, name: &str) -> Result<ProjectKnowledge> {
        self.mutate(Operation::SetProjectName, &mut |k: &mut ProjectKnowledge| {
            k.set_project_name(name);
            true
        })
    }

    fn set_latest_spec(&self, spec: &SpecDocument) -> Result<ProjectKnowledge> {
        self.mutate(Operation::SetLatestSpec, &mut |k: &mut ProjectKnowledge| {
            k.set_latest_spec(spec.clone());
            true
        })
    }
}

/// Open the store at `path` with the backend its suffix selects
pub fn open_knowledge(path: &Path, config: &StoreConfig) -> Arc<dyn KnowledgeBackend> {
    match BackendKind::for_path(path) {
        BackendKind::Sqlite => Arc::new(SqliteKnowledge::new(path, *config)),
        BackendKind::Yaml => Arc::new(YamlKnowledge::new(path, *config)),
    }
}

// ============================================================================
// Legacy (v1) conversion
// ============================================================================

/// Validate one legacy record. Invalid records are logged and skipped.
pub(crate) fn legacy_record(
    path: &Path,
    index: usize,
    role: Option<&str>,
    content: Option<&str>,
    ts: Option<&str>,
) -> Option<(AppendItem, DateTime<Utc>)> {
    let skip = |reason: &str| {
        tracing::warn!(path = %path.display(), index, reason, "legacy record skipped");
        None
    };
    let Some(role) = role.and_then(|r| r.parse::<Role>().ok()) else {
        return skip("unknown role");
    };
    let Some(content) = content.map(str::trim).filter(|c| !c.is_empty()) else {
        return skip("blank content");
    };
    let Some(ts) = ts.and_then(crate::versioned::parse_legacy_ts) else {
        return skip("bad timestamp");
    };
    Some((AppendItem::new(role, content), ts))
}

/// Build the in-memory v2 state from validated legacy records
pub(crate) fn upgrade_legacy(
    project_name: Option<&str>,
    latest_spec_yaml: Option<&str>,
    records: Vec<(AppendItem, DateTime<Utc>)>,
) -> ProjectKnowledge {
    let mut knowledge = ProjectKnowledge::empty();
    let mut last_ts = None;
    for (item, ts) in records {
        knowledge.append(std::slice::from_ref(&item), ts);
        last_ts = Some(ts);
    }
    if let Some(name) = project_name {
        knowledge.set_project_name(name);
    }
    if let Some(raw) = latest_spec_yaml.map(str::trim).filter(|s| !s.is_empty()) {
        let value = serde_yaml::from_str::<serde_json::Value>(raw)
            .unwrap_or(serde_json::Value::Null);
        knowledge.latest_spec = Some(normalize_at(&value, last_ts.unwrap_or_default()));
    }
    knowledge
}

#[cfg(test)]
mod tests;
