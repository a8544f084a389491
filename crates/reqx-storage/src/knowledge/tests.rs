//! Knowledge store tests across backends

use super::*;
use crate::error::{ErrorKind, StoreError};
use crate::lock::FileLock;
use chrono::TimeZone;
use proptest::prelude::*;
use reqx_core::CURRENT_SCHEMA_VERSION;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn fast() -> StoreConfig {
    StoreConfig {
        lock_timeout: Duration::from_millis(50),
        lock_poll_interval: Duration::from_millis(5),
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 30, 10, minute, 0).unwrap()
}

fn both(dir: &Path) -> Vec<Arc<dyn KnowledgeBackend>> {
    vec![
        open_knowledge(&dir.join("knowledge.yaml"), &fast()),
        open_knowledge(&dir.join("knowledge.db"), &fast()),
    ]
}

#[test]
fn test_backend_for_suffix() {
    assert_eq!(BackendKind::for_path(Path::new("a/k.db")), BackendKind::Sqlite);
    assert_eq!(BackendKind::for_path(Path::new("k.SQLITE3")), BackendKind::Sqlite);
    assert_eq!(BackendKind::for_path(Path::new("k.sqlite")), BackendKind::Sqlite);
    assert_eq!(BackendKind::for_path(Path::new("k.yaml")), BackendKind::Yaml);
    assert_eq!(BackendKind::for_path(Path::new("knowledge")), BackendKind::Yaml);
}

#[test]
fn test_missing_store_reads_empty_without_creating() {
    let dir = tempdir().unwrap();
    for store in both(dir.path()) {
        let k = store.read().unwrap();
        assert_eq!(k, ProjectKnowledge::empty());
        assert_eq!(k.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(!store.path().exists());
    }
}

#[test]
fn test_scenario_two_appends_same_role() {
    let dir = tempdir().unwrap();
    for store in both(dir.path()) {
        store
            .append(Role::User, &["goal: vocabulary app".to_string()])
            .unwrap();
        let k = store
            .append(Role::User, &["feature: spaced repetition".to_string()])
            .unwrap();

        assert_eq!(k.items.len(), 2);
        assert_eq!(k.items[0].sequence, 1);
        assert_eq!(k.items[1].sequence, 2);
        assert_eq!(k.items[1].text, "feature: spaced repetition");
        assert_eq!(store.read().unwrap(), k);
    }
}

#[test]
fn test_project_name_is_metadata_only() {
    let dir = tempdir().unwrap();
    for store in both(dir.path()) {
        store.append(Role::User, &["x".to_string()]).unwrap();
        let k = store.set_project_name("Vocab").unwrap();
        assert_eq!(k.project_name.as_deref(), Some("Vocab"));
        assert_eq!(k.items.len(), 1);

        let k = store.append(Role::Assistant, &["y".to_string()]).unwrap();
        assert_eq!(k.project_name.as_deref(), Some("Vocab"));
    }
}

#[test]
fn test_latest_spec_round_trips() {
    let dir = tempdir().unwrap();
    let spec = normalize_at(&serde_json::json!({"demandId": "D"}), at(5));
    for store in both(dir.path()) {
        store.set_latest_spec(&spec).unwrap();
        assert_eq!(store.read().unwrap().latest_spec, Some(spec.clone()));
    }
}

#[test]
fn test_repeated_reads_leave_bytes_identical() {
    let dir = tempdir().unwrap();
    for store in both(dir.path()) {
        store
            .append_items(&[AppendItem::new(Role::User, "a")], at(1))
            .unwrap();
        let before = fs::read(store.path()).unwrap();
        store.read().unwrap();
        store.read().unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }
}

#[test]
fn test_backends_agree_field_for_field() {
    let dir = tempdir().unwrap();
    let results: Vec<ProjectKnowledge> = both(dir.path())
        .into_iter()
        .map(|store| {
            store
                .append_items(
                    &[
                        AppendItem::new(Role::User, "goal: g"),
                        AppendItem::new(Role::Assistant, "  risk: r  "),
                        AppendItem::new(Role::System, ""),
                    ],
                    at(1),
                )
                .unwrap();
            store.set_project_name("P").unwrap();
            store
                .append_items(&[AppendItem::new(Role::System, "note")], at(2))
                .unwrap();
            store.read().unwrap()
        })
        .collect();

    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].items.len(), 3);
    assert_eq!(results[0].items[1].text, "risk: r");
}

#[test]
fn test_blank_only_append_does_not_write() {
    let dir = tempdir().unwrap();
    for store in both(dir.path()) {
        let k = store.append(Role::User, &["   ".to_string()]).unwrap();
        assert!(k.items.is_empty());
        assert!(!store.path().exists(), "{}", store.path().display());
    }
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1, "only the yaml lock sidecar");
}

#[test]
fn test_blank_only_append_on_existing_sqlite_store() {
    let dir = tempdir().unwrap();
    let store = open_knowledge(&dir.path().join("k.db"), &fast());
    store
        .append_items(&[AppendItem::new(Role::User, "goal: x")], at(0))
        .unwrap();
    let before = fs::read(store.path()).unwrap();

    let k = store.append(Role::User, &["\t".to_string()]).unwrap();
    assert_eq!(k.items.len(), 1);
    assert_eq!(fs::read(store.path()).unwrap(), before);
}

#[test]
fn test_interrupted_write_leaves_store_readable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("knowledge.yaml");
    let store = YamlKnowledge::new(&path, fast());
    let written = store
        .append_items(
            &[
                AppendItem::new(Role::User, "goal: vocabulary app"),
                AppendItem::new(Role::Assistant, "feature: spaced repetition"),
            ],
            at(0),
        )
        .unwrap();

    let staged =
        crate::atomic::StagedWrite::stage(&path, b"schema_version: 2\nitems: [ {{{").unwrap();
    let temp = staged.temp_path().to_path_buf();
    drop(staged);

    assert!(!temp.exists());
    assert_eq!(store.read().unwrap(), written);
    let next = store.append(Role::User, &["risk: churn".to_string()]).unwrap();
    assert_eq!(next.items.last().map(|i| i.sequence), Some(3));
}

#[test]
fn test_yaml_lock_contention_is_concurrency_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.yaml");
    let store = open_knowledge(&path, &fast());

    let held = FileLock::acquire(&path, &fast()).unwrap();
    let err = store.append(Role::User, &["x".to_string()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    assert!(!path.exists());

    drop(held);
    assert_eq!(store.append(Role::User, &["x".to_string()]).unwrap().items.len(), 1);
}

#[test]
fn test_yaml_lock_released_after_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.yaml");
    fs::write(&path, "schema_version: 99\n").unwrap();
    let store = open_knowledge(&path, &fast());

    assert!(store.append(Role::User, &["x".to_string()]).is_err());
    assert!(FileLock::acquire(&path, &fast()).is_ok());
}

#[test]
fn test_sqlite_write_contention_is_concurrency_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.db");
    let store = open_knowledge(&path, &fast());
    store.append(Role::User, &["first".to_string()]).unwrap();

    let mut other = rusqlite::Connection::open(&path).unwrap();
    let tx = other
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .unwrap();
    let err = store.append(Role::User, &["second".to_string()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    drop(tx);

    assert_eq!(store.read().unwrap().items.len(), 1);
}

#[test]
fn test_newer_schema_is_refused() {
    let dir = tempdir().unwrap();
    let yaml = dir.path().join("k.yaml");
    fs::write(&yaml, "schema_version: 3\nitems: []\n").unwrap();

    let db = dir.path().join("k.db");
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.pragma_update(None, "user_version", 3).unwrap();
    }

    for path in [yaml, db] {
        let store = open_knowledge(&path, &fast());
        let before = fs::read(&path).unwrap();
        assert!(matches!(
            store.read().unwrap_err(),
            StoreError::SchemaVersion { found: 3, .. }
        ));
        assert_eq!(
            store.append(Role::User, &["x".to_string()]).unwrap_err().kind(),
            ErrorKind::SchemaVersion
        );
        assert_eq!(fs::read(&path).unwrap(), before);
    }
}

#[test]
fn test_legacy_yaml_upgrades_in_memory_then_on_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.yaml");
    let legacy = "\
schema_version: 1
project_name: Vocab
latest_spec_yaml: |
  demand_id: VOC-1
  root_goal: learn words
records:
- role: user
  content: '  goal: learn words '
  ts: '2026-01-30T10:00:00+00:00'
- role: robot
  content: ignored
  ts: '2026-01-30T10:01:00+00:00'
- role: assistant
  content: 'feature: flashcards'
  ts: '2026-01-30T10:02:00+00:00'
";
    fs::write(&path, legacy).unwrap();
    let store = open_knowledge(&path, &fast());

    let k = store.read().unwrap();
    assert_eq!(k.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(k.project_name.as_deref(), Some("Vocab"));
    assert_eq!(k.items.len(), 2);
    assert_eq!(k.items[0].text, "goal: learn words");
    assert_eq!(k.items[1].sequence, 2);
    let spec = k.latest_spec.clone().unwrap();
    assert_eq!(spec.demand_id, "VOC-1");
    assert_eq!(spec.generated_at, at(2));
    assert_eq!(fs::read_to_string(&path).unwrap(), legacy);

    let k = store.append(Role::User, &["risk: boredom".to_string()]).unwrap();
    assert_eq!(k.items[2].sequence, 3);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("schema_version: 2"));
    assert!(!text.contains("records:"));
    assert_eq!(store.read().unwrap(), k);
}

#[test]
fn test_legacy_sqlite_upgrades_on_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE records (id INTEGER PRIMARY KEY AUTOINCREMENT,
                 role TEXT NOT NULL, content TEXT NOT NULL, ts TEXT NOT NULL);
             INSERT INTO meta VALUES ('schema_version', '1'), ('project_name', 'Old');
             INSERT INTO records (role, content, ts)
                 VALUES ('user', 'goal: a', '2026-01-30T10:00:00+00:00'),
                        ('assistant', '   ', '2026-01-30T10:01:00+00:00'),
                        ('system', 'note', '2026-01-30T10:03:00+00:00');",
        )
        .unwrap();
    }
    let store = open_knowledge(&path, &fast());

    let k = store.read().unwrap();
    assert_eq!(k.items.len(), 2);
    assert_eq!(k.items[1].role, Role::System);
    assert_eq!(k.items[1].sequence, 2);
    assert_eq!(k.project_name.as_deref(), Some("Old"));
    assert!(k.latest_spec.is_none());

    let k = store.append(Role::User, &["risk: r".to_string()]).unwrap();
    assert_eq!(k.items.len(), 3);
    assert_eq!(store.read().unwrap(), k);

    let conn = rusqlite::Connection::open(&path).unwrap();
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap();
    assert_eq!(version, 2);
    assert!(!crate::sql::table_exists(&conn, "records").unwrap());
}

#[test]
fn test_corrupt_yaml_read_fails_and_write_quarantines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.yaml");
    fs::write(&path, "schema_version: 2\nitems: [unclosed\n").unwrap();
    let store = open_knowledge(&path, &fast());

    assert_eq!(store.read().unwrap_err().kind(), ErrorKind::Storage);

    let k = store.append(Role::User, &["fresh".to_string()]).unwrap();
    assert_eq!(k.items.len(), 1);
    assert_eq!(k.items[0].sequence, 1);

    let backups: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("k.yaml.broken.") && n.ends_with(".bak"))
        .collect();
    assert_eq!(backups.len(), 1);
}

#[test]
fn test_memory_backend_never_touches_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.yaml");
    let store = MemoryKnowledge::new(&path);

    store.append(Role::User, &["a".to_string()]).unwrap();
    store.set_project_name("P").unwrap();
    assert_eq!(store.read().unwrap().items.len(), 1);
    assert!(!path.exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_append_then_read_tail(
        first in prop::collection::vec("[a-z]{1,10}", 0..4),
        second in prop::collection::vec("[a-z]{1,10}", 1..5),
        sqlite in any::<bool>(),
    ) {
        let dir = tempdir().unwrap();
        let name = if sqlite { "k.db" } else { "k.yaml" };
        let store = open_knowledge(&dir.path().join(name), &fast());

        store.append(Role::Assistant, &first).unwrap();
        store.append(Role::User, &second).unwrap();
        let k = store.read().unwrap();

        let tail: Vec<&str> = k.items[k.items.len() - second.len()..]
            .iter()
            .map(|i| i.text.as_str())
            .collect();
        let expected: Vec<&str> = second.iter().map(String::as_str).collect();
        prop_assert_eq!(tail, expected);
        prop_assert!(k.items.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }
}
