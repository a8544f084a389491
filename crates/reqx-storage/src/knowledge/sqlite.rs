//! Single-file SQLite knowledge backend
//!
//! Version 2 tables:
//!
//! ```text
//! meta  (key TEXT PRIMARY KEY, value TEXT NOT NULL)
//!        schema_version | project_name | latest_spec (JSON)
//! items (sequence INTEGER PRIMARY KEY, role, text, added_at)
//! ```
//!
//! Version 1 stores (`records(id, role, content, ts)`, no user version) are
//! read as-is and rewritten in the new layout by the first mutation.

use super::{legacy_record, upgrade_legacy, KnowledgeBackend};
use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use crate::sql::{
    begin_read, begin_write, meta_text, open_read, open_write, put_meta, read_meta,
    stored_version, table_exists, SqlCtx,
};
use crate::versioned::{ensure_supported, parse_legacy_ts};
use chrono::SecondsFormat;
use reqx_core::{KnowledgeItem, ProjectKnowledge, Role, SpecDocument, CURRENT_SCHEMA_VERSION};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
    CREATE TABLE IF NOT EXISTS items (
        sequence INTEGER PRIMARY KEY,
        role TEXT NOT NULL,
        text TEXT NOT NULL,
        added_at TEXT NOT NULL
    );
";

/// Knowledge store in a SQLite database file
pub struct SqliteKnowledge {
    path: PathBuf,
    config: StoreConfig,
}

impl SqliteKnowledge {
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Load the store and report the version it was stored in
    fn load(&self, cx: &SqlCtx<'_>, conn: &Connection) -> Result<(ProjectKnowledge, u32)> {
        let Some(version) = stored_version(conn, "records").map_err(|e| cx.err(e))? else {
            return Ok((ProjectKnowledge::empty(), CURRENT_SCHEMA_VERSION));
        };
        ensure_supported(&self.path, version)?;

        let meta = read_meta(conn).map_err(|e| cx.err(e))?;
        if version < CURRENT_SCHEMA_VERSION {
            return Ok((self.load_legacy(cx, conn, &meta)?, version));
        }

        let latest_spec = match meta_text(&meta, "latest_spec") {
            Some(raw) => Some(
                serde_json::from_str::<SpecDocument>(raw)
                    .map_err(|e| StoreError::corrupt(&self.path, e))?,
            ),
            None => None,
        };

        let mut items = Vec::new();
        if table_exists(conn, "items").map_err(|e| cx.err(e))? {
            let mut stmt = conn
                .prepare("SELECT sequence, role, text, added_at FROM items ORDER BY sequence")
                .map_err(|e| cx.err(e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| cx.err(e))?;
            for row in rows {
                let (sequence, role, text, added_at) = row.map_err(|e| cx.err(e))?;
                items.push(KnowledgeItem {
                    role: role
                        .parse::<Role>()
                        .map_err(|e| StoreError::corrupt(&self.path, e))?,
                    text,
                    sequence: u64::try_from(sequence).map_err(|e| StoreError::corrupt(&self.path, e))?,
                    added_at: parse_legacy_ts(&added_at).ok_or_else(|| {
                        StoreError::corrupt(&self.path, format!("bad added_at `{added_at}`"))
                    })?,
                });
            }
        }

        Ok((
            ProjectKnowledge {
                schema_version: version,
                project_name: meta_text(&meta, "project_name").map(str::to_string),
                items,
                latest_spec,
            },
            version,
        ))
    }

    fn load_legacy(
        &self,
        cx: &SqlCtx<'_>,
        conn: &Connection,
        meta: &std::collections::HashMap<String, String>,
    ) -> Result<ProjectKnowledge> {
        let mut records = Vec::new();
        if table_exists(conn, "records").map_err(|e| cx.err(e))? {
            let mut stmt = conn
                .prepare("SELECT role, content, ts FROM records ORDER BY id")
                .map_err(|e| cx.err(e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .map_err(|e| cx.err(e))?;
            for (index, row) in rows.enumerate() {
                let (role, content, ts) = row.map_err(|e| cx.err(e))?;
                if let Some(record) = legacy_record(
                    &self.path,
                    index,
                    role.as_deref(),
                    content.as_deref(),
                    ts.as_deref(),
                ) {
                    records.push(record);
                }
            }
        }
        tracing::debug!(path = %self.path.display(), "legacy knowledge database upgraded in memory");
        Ok(upgrade_legacy(
            meta_text(meta, "project_name"),
            meta_text(meta, "latest_spec_yaml"),
            records,
        ))
    }

    /// Write `knowledge` back. Items from `first_new` on are inserted; a
    /// legacy database is rewritten in full.
    fn persist(
        &self,
        cx: &SqlCtx<'_>,
        conn: &Connection,
        knowledge: &ProjectKnowledge,
        stored: u32,
        first_new: usize,
    ) -> Result<()> {
        let sq = |e: rusqlite::Error| cx.err(e);
        conn.execute_batch(SCHEMA).map_err(sq)?;

        let start = if stored < CURRENT_SCHEMA_VERSION {
            conn.execute_batch(
                "DELETE FROM items;
                 DROP TABLE IF EXISTS records;
                 DELETE FROM meta WHERE key = 'latest_spec_yaml';",
            )
            .map_err(sq)?;
            0
        } else {
            first_new
        };

        {
            let mut insert = conn
                .prepare("INSERT INTO items (sequence, role, text, added_at) VALUES (?1, ?2, ?3, ?4)")
                .map_err(sq)?;
            for item in &knowledge.items[start..] {
                insert
                    .execute(params![
                        i64::try_from(item.sequence).unwrap_or(i64::MAX),
                        item.role.as_str(),
                        item.text,
                        item.added_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    ])
                    .map_err(sq)?;
            }
        }

        let latest_spec = match &knowledge.latest_spec {
            Some(spec) => serde_json::to_string(spec)
                .map_err(|e| StoreError::encode(&self.path, cx.op, e))?,
            None => String::new(),
        };
        put_meta(conn, "schema_version", &CURRENT_SCHEMA_VERSION.to_string()).map_err(sq)?;
        put_meta(conn, "project_name", knowledge.project_name.as_deref().unwrap_or("")).map_err(sq)?;
        put_meta(conn, "latest_spec", &latest_spec).map_err(sq)?;
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
            .map_err(sq)?;
        Ok(())
    }
}

impl KnowledgeBackend for SqliteKnowledge {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ProjectKnowledge> {
        let cx = SqlCtx::new(&self.path, Operation::Read, &self.config);
        let Some(mut conn) = open_read(&cx, &self.config)? else {
            return Ok(ProjectKnowledge::empty());
        };
        let tx = begin_read(&cx, &mut conn)?;
        let (knowledge, _) = self.load(&cx, &tx)?;
        tx.finish().map_err(|e| cx.err(e))?;
        Ok(knowledge)
    }

    fn mutate(
        &self,
        op: Operation,
        change: &mut dyn FnMut(&mut ProjectKnowledge) -> bool,
    ) -> Result<ProjectKnowledge> {
        if !self.path.exists() {
            // Opening for write creates the file; skip that for a no-op.
            let mut empty = ProjectKnowledge::empty();
            if !change(&mut empty) {
                return Ok(empty);
            }
        }

        let cx = SqlCtx::new(&self.path, op, &self.config);
        let mut conn = open_write(&cx, &self.config)?;
        let tx = begin_write(&cx, &mut conn)?;

        let (mut knowledge, stored) = self.load(&cx, &tx)?;
        let before = knowledge.items.len();
        if !change(&mut knowledge) {
            return Ok(knowledge);
        }
        knowledge.schema_version = CURRENT_SCHEMA_VERSION;

        self.persist(&cx, &tx, &knowledge, stored, before)?;
        tx.commit().map_err(|e| cx.err(e))?;
        tracing::debug!(
            path = %self.path.display(),
            %op,
            items = knowledge.items.len(),
            "knowledge committed"
        );
        Ok(knowledge)
    }
}
