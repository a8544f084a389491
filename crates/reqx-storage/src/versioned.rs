//! Schema-version helpers shared by the YAML backends

use crate::error::{Operation, Result, StoreError};
use chrono::{DateTime, Utc};
use reqx_core::CURRENT_SCHEMA_VERSION;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Files without a version marker predate versioning.
pub(crate) const LEGACY_SCHEMA_VERSION: u32 = 1;

/// Read a file, treating "not found" as `None`
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, Operation::Read, e)),
    }
}

/// Find the top-level `schema_version:` line without parsing the document
pub(crate) fn peek_yaml_version(path: &Path, text: &str) -> Result<Option<u32>> {
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("schema_version:") else {
            continue;
        };
        let raw = rest
            .split('#')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        if raw.is_empty() {
            return Ok(None);
        }
        return raw
            .parse::<u32>()
            .map(|v| Some(v.max(LEGACY_SCHEMA_VERSION)))
            .map_err(|_| StoreError::corrupt(path, format!("bad schema_version `{raw}`")));
    }
    Ok(None)
}

pub(crate) fn ensure_supported(path: &Path, found: u32) -> Result<()> {
    if found > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            path: path.to_path_buf(),
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Move an unreadable file aside as `<name>.broken.<unix-ts>.<rand>.bak`
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = uuid::Uuid::new_v4().simple().to_string();
    let backup = path.with_file_name(format!(
        "{name}.broken.{}.{}.bak",
        Utc::now().timestamp(),
        &token[..8]
    ));
    fs::rename(path, &backup).map_err(|e| StoreError::io(path, Operation::Quarantine, e))?;
    tracing::warn!(
        path = %path.display(),
        backup = %backup.display(),
        "unreadable store moved aside, starting empty"
    );
    Ok(backup)
}

/// Parse a legacy timestamp (RFC 3339 with offset)
pub(crate) fn parse_legacy_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
