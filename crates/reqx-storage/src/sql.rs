//! SQLite plumbing shared by the knowledge and transcript backends
//!
//! Reads open the file read-only and never create it. Writes run inside a
//! `BEGIN IMMEDIATE` transaction so the read-modify-write is serialized
//! against every other writer; the busy timeout is the store's lock timeout.

use crate::config::StoreConfig;
use crate::error::{Operation, Result, StoreError};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Error context for one SQLite operation
#[derive(Debug, Clone, Copy)]
pub(crate) struct SqlCtx<'a> {
    pub path: &'a Path,
    pub op: Operation,
    pub timeout_ms: u64,
}

impl<'a> SqlCtx<'a> {
    pub fn new(path: &'a Path, op: Operation, config: &StoreConfig) -> Self {
        Self {
            path,
            op,
            timeout_ms: config.timeout_ms(),
        }
    }

    pub fn err(&self, e: rusqlite::Error) -> StoreError {
        StoreError::sqlite(self.path, self.op, self.timeout_ms, e)
    }
}

/// Open an existing database read-only. `None` when the file is missing.
pub(crate) fn open_read(cx: &SqlCtx<'_>, config: &StoreConfig) -> Result<Option<Connection>> {
    if !cx.path.exists() {
        return Ok(None);
    }
    let conn = Connection::open_with_flags(
        cx.path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| cx.err(e))?;
    conn.busy_timeout(config.lock_timeout)
        .map_err(|e| cx.err(e))?;
    Ok(Some(conn))
}

pub(crate) fn open_write(cx: &SqlCtx<'_>, config: &StoreConfig) -> Result<Connection> {
    if let Some(parent) = cx.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(cx.path, cx.op, e))?;
    }
    let conn = Connection::open(cx.path).map_err(|e| cx.err(e))?;
    conn.busy_timeout(config.lock_timeout)
        .map_err(|e| cx.err(e))?;
    Ok(conn)
}

pub(crate) fn begin_read<'c>(cx: &SqlCtx<'_>, conn: &'c mut Connection) -> Result<Transaction<'c>> {
    conn.transaction_with_behavior(TransactionBehavior::Deferred)
        .map_err(|e| cx.err(e))
}

pub(crate) fn begin_write<'c>(
    cx: &SqlCtx<'_>,
    conn: &'c mut Connection,
) -> Result<Transaction<'c>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| cx.err(e))
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

/// Stored schema version.
///
/// `PRAGMA user_version` carries it from version 2 on. A database with no
/// user version but with `legacy_table` (or `meta`) present is version 1;
/// a database with neither is empty and reported as `None`.
pub(crate) fn stored_version(conn: &Connection, legacy_table: &str) -> rusqlite::Result<Option<u32>> {
    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version > 0 {
        return Ok(Some(u32::try_from(user_version).unwrap_or(u32::MAX)));
    }
    if table_exists(conn, legacy_table)? || table_exists(conn, "meta")? {
        return Ok(Some(1));
    }
    Ok(None)
}

pub(crate) fn read_meta(conn: &Connection) -> rusqlite::Result<HashMap<String, String>> {
    if !table_exists(conn, "meta")? {
        return Ok(HashMap::new());
    }
    let mut stmt = conn.prepare("SELECT key, value FROM meta")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;
    let mut out = HashMap::new();
    for row in rows {
        let (key, value) = row?;
        out.insert(key, value.unwrap_or_default());
    }
    Ok(out)
}

pub(crate) fn put_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Non-blank meta value
pub(crate) fn meta_text<'m>(meta: &'m HashMap<String, String>, key: &str) -> Option<&'m str> {
    meta.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}
