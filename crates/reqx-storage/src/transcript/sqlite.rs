//! SQLite transcript backend
//!
//! ```text
//! meta    (key TEXT PRIMARY KEY, value TEXT NOT NULL)   schema_version | session_id
//! entries (turn_index INTEGER PRIMARY KEY, role, content, at)
//! ```

use super::{upgrade_legacy_turns, TranscriptBackend, TranscriptLog};
use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use crate::sql::{
    begin_read, begin_write, meta_text, open_read, open_write, put_meta, read_meta,
    stored_version, table_exists, SqlCtx,
};
use crate::versioned::{ensure_supported, parse_legacy_ts};
use chrono::SecondsFormat;
use reqx_core::{TranscriptEntry, TranscriptRole, CURRENT_SCHEMA_VERSION};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
    CREATE TABLE IF NOT EXISTS entries (
        turn_index INTEGER PRIMARY KEY,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        at TEXT NOT NULL
    );
";

/// Transcript in a SQLite database file
pub struct SqliteTranscript {
    path: PathBuf,
    config: StoreConfig,
}

impl SqliteTranscript {
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    fn corrupt(&self, reason: impl std::fmt::Display) -> StoreError {
        StoreError::corrupt(&self.path, reason)
    }

    fn decode(&self, cx: &SqlCtx<'_>, conn: &Connection) -> Result<(Option<TranscriptLog>, u32)> {
        let sq = |e: rusqlite::Error| cx.err(e);
        let Some(version) = stored_version(conn, "turns").map_err(sq)? else {
            return Ok((None, CURRENT_SCHEMA_VERSION));
        };
        ensure_supported(&self.path, version)?;
        let meta = read_meta(conn).map_err(sq)?;

        if version < CURRENT_SCHEMA_VERSION {
            let mut rows = Vec::new();
            if table_exists(conn, "turns").map_err(sq)? {
                let mut stmt = conn
                    .prepare("SELECT role, content, ts FROM turns ORDER BY id")
                    .map_err(sq)?;
                let mapped = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })
                    .map_err(sq)?;
                for row in mapped {
                    rows.push(row.map_err(sq)?);
                }
            }
            let turns = rows
                .iter()
                .map(|(r, c, t)| (r.as_deref(), c.as_deref(), t.as_deref()));
            let log = TranscriptLog {
                schema_version: CURRENT_SCHEMA_VERSION,
                session_id: None,
                entries: upgrade_legacy_turns(&self.path, turns),
            };
            return Ok((Some(log), version));
        }

        let session_id = match meta_text(&meta, "session_id") {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|e| self.corrupt(e))?),
            None => None,
        };

        let mut entries = Vec::new();
        if table_exists(conn, "entries").map_err(sq)? {
            let mut stmt = conn
                .prepare("SELECT turn_index, role, content, at FROM entries ORDER BY turn_index")
                .map_err(sq)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(sq)?;
            for row in mapped {
                let (turn_index, role, content, at) = row.map_err(sq)?;
                entries.push(TranscriptEntry {
                    turn_index: u64::try_from(turn_index).map_err(|e| self.corrupt(e))?,
                    role: role.parse::<TranscriptRole>().map_err(|e| self.corrupt(e))?,
                    content,
                    at: parse_legacy_ts(&at)
                        .ok_or_else(|| self.corrupt(format!("bad timestamp `{at}`")))?,
                });
            }
        }

        let log = TranscriptLog {
            schema_version: version,
            session_id,
            entries,
        };
        Ok((Some(log), version))
    }

    fn persist(
        &self,
        cx: &SqlCtx<'_>,
        conn: &Connection,
        log: &TranscriptLog,
        stored: u32,
        first_new: usize,
    ) -> Result<()> {
        let sq = |e: rusqlite::Error| cx.err(e);
        conn.execute_batch(SCHEMA).map_err(sq)?;

        // A reset shrinks the log; a migration changes the table.
        let start = if stored < CURRENT_SCHEMA_VERSION || first_new > log.entries.len() {
            conn.execute_batch("DELETE FROM entries; DROP TABLE IF EXISTS turns;")
                .map_err(sq)?;
            0
        } else {
            first_new
        };

        {
            let mut insert = conn
                .prepare("INSERT INTO entries (turn_index, role, content, at) VALUES (?1, ?2, ?3, ?4)")
                .map_err(sq)?;
            for entry in &log.entries[start..] {
                insert
                    .execute(params![
                        i64::try_from(entry.turn_index).unwrap_or(i64::MAX),
                        entry.role.as_str(),
                        entry.content,
                        entry.at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    ])
                    .map_err(sq)?;
            }
        }

        let session = log.session_id.map(|id| id.to_string()).unwrap_or_default();
        put_meta(conn, "schema_version", &CURRENT_SCHEMA_VERSION.to_string()).map_err(sq)?;
        put_meta(conn, "session_id", &session).map_err(sq)?;
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
            .map_err(sq)?;
        Ok(())
    }
}

impl TranscriptBackend for SqliteTranscript {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<TranscriptLog>> {
        let cx = SqlCtx::new(&self.path, Operation::Read, &self.config);
        let Some(mut conn) = open_read(&cx, &self.config)? else {
            return Ok(None);
        };
        let tx = begin_read(&cx, &mut conn)?;
        let (log, _) = self.decode(&cx, &tx)?;
        tx.finish().map_err(|e| cx.err(e))?;
        Ok(log)
    }

    fn mutate(
        &self,
        op: Operation,
        change: &mut dyn FnMut(&mut TranscriptLog) -> bool,
    ) -> Result<TranscriptLog> {
        let cx = SqlCtx::new(&self.path, op, &self.config);
        let mut conn = open_write(&cx, &self.config)?;
        let tx = begin_write(&cx, &mut conn)?;

        let (log, stored) = self.decode(&cx, &tx)?;
        let mut log = log.unwrap_or_else(TranscriptLog::empty);
        let before = log.entries.len();
        let first_session = log.session_id;
        if !change(&mut log) {
            return Ok(log);
        }
        // Same length but a new owner means the log was cleared and refilled.
        let first_new = if log.session_id != first_session && first_session.is_some() {
            usize::MAX
        } else {
            before
        };
        log.schema_version = CURRENT_SCHEMA_VERSION;

        self.persist(&cx, &tx, &log, stored, first_new)?;
        tx.commit().map_err(|e| cx.err(e))?;
        tracing::debug!(path = %self.path.display(), %op, entries = log.entries.len(), "transcript committed");
        Ok(log)
    }
}
