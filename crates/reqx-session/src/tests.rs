//! Session controller and service tests

use super::*;
use chrono::{DateTime, TimeZone, Utc};
use reqx_core::{ProjectKnowledge, Role, TagExtractor, TranscriptRole};
use reqx_storage::{open_knowledge, StoreConfig};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn fixed_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 30, 10, 0, 0).unwrap()
}

fn lines(input: &[&str]) -> std::vec::IntoIter<String> {
    input
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .into_iter()
}

fn controller(dir: &Path, replies: &[&str]) -> SessionController {
    let config = SessionConfig::new(dir.join("knowledge.yaml"), dir.join("transcript.yaml"));
    open(&config, replies)
}

fn open(config: &SessionConfig, replies: &[&str]) -> SessionController {
    SessionController::open(config, Box::new(ScriptedReplies::new(replies.to_vec())))
        .unwrap()
        .with_clock(fixed_clock)
}

struct Failing;

impl ReplyModel for Failing {
    fn reply(&mut self, _context: &ChatContext<'_>) -> std::result::Result<String, ModelError> {
        Err(ModelError::Unavailable("no network".into()))
    }
}

// ============================================================================
// Command parsing
// ============================================================================

#[test]
fn test_parse_reserved_commands() {
    assert_eq!(parse_command("show"), Some(Command::Show));
    assert_eq!(parse_command("  SPEC "), Some(Command::Spec));
    assert_eq!(parse_command("/done"), Some(Command::Done(None)));
    assert_eq!(
        parse_command("/done Vocab Trainer"),
        Some(Command::Done(Some("Vocab Trainer".into())))
    );
    assert_eq!(parse_command("Reset"), Some(Command::Reset));
    assert_eq!(parse_command("quit"), Some(Command::Exit));
    assert_eq!(parse_command("/exit"), Some(Command::Exit));
    assert_eq!(parse_command("?"), Some(Command::Help));
}

#[test]
fn test_sentences_are_free_text() {
    assert_eq!(parse_command("done with the login page"), None);
    assert_eq!(parse_command("show me the options"), None);
    assert_eq!(parse_command("/spec please"), None);
    assert_eq!(parse_command(""), None);
    assert_eq!(parse_command("done."), None);
}

// ============================================================================
// Controller
// ============================================================================

#[test]
fn test_reply_appends_extracted_items() {
    let dir = tempdir().unwrap();
    let config = SessionConfig::new(dir.path().join("k.yaml"), dir.path().join("t.yaml"))
        .tag("TAG");
    let mut session = open(
        &config,
        &[r#"Sure. <TAG>{"append":["x"]}</TAG> Done."#],
    );

    let outcome = session.handle("we need x").unwrap();
    match outcome {
        Outcome::Reply {
            display_text,
            appended,
            warnings,
        } => {
            assert_eq!(display_text, "Sure.  Done.");
            assert_eq!(appended.len(), 1);
            assert_eq!(appended[0].text, "x");
            assert_eq!(appended[0].role, Role::Assistant);
            assert_eq!(appended[0].sequence, 1);
            assert!(warnings.is_empty());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Idle);

    let transcript = session.transcript().unwrap();
    assert_eq!(transcript.entries.len(), 2);
    assert_eq!(transcript.entries[0].content, "we need x");
    assert_eq!(transcript.entries[1].content, "Sure.  Done.");
}

#[test]
fn test_sequences_continue_across_replies() {
    let dir = tempdir().unwrap();
    let mut session = controller(
        dir.path(),
        &[
            r#"<KNOWLEDGE>{"append":[{"role":"user","text":"goal: vocabulary app"}]}</KNOWLEDGE>ok"#,
            r#"<KNOWLEDGE>["feature: spaced repetition"]</KNOWLEDGE>noted"#,
        ],
    );
    session.handle("I want a vocabulary app").unwrap();
    session.handle("with spaced repetition").unwrap();

    let Outcome::Knowledge { knowledge } = session.handle("show").unwrap() else {
        panic!("show must return knowledge");
    };
    let items: Vec<_> = knowledge
        .items
        .iter()
        .map(|i| (i.role, i.text.as_str(), i.sequence))
        .collect();
    assert_eq!(
        items,
        vec![
            (Role::User, "goal: vocabulary app", 1),
            (Role::Assistant, "feature: spaced repetition", 2),
        ]
    );
}

#[test]
fn test_spec_over_empty_store() {
    let dir = tempdir().unwrap();
    let mut session = controller(dir.path(), &[]);

    let Outcome::Spec { spec } = session.handle("spec").unwrap() else {
        panic!("spec must return a document");
    };
    assert_eq!(spec.root_goal, "");
    assert!(spec.proposed_solutions.is_empty());
    assert!(!spec.validation_errors.is_empty());
    assert_eq!(spec.generated_at, fixed_clock());
    assert!(!dir.path().join("knowledge.yaml").exists());
}

#[test]
fn test_done_stores_spec_and_terminates() {
    let dir = tempdir().unwrap();
    let mut session = controller(
        dir.path(),
        &[r#"<KNOWLEDGE>["goal: vocabulary app"]</KNOWLEDGE>ok"#],
    );
    session.handle("hello").unwrap();

    let Outcome::Done { spec, project_name } =
        session.handle("/done Vocab Trainer").unwrap()
    else {
        panic!("done must return the stored document");
    };
    assert_eq!(spec.root_goal, "vocabulary app");
    assert_eq!(project_name.as_deref(), Some("Vocab Trainer"));
    assert_eq!(session.state(), SessionState::Terminated);

    let stored = open_knowledge(&dir.path().join("knowledge.yaml"), &StoreConfig::default())
        .read()
        .unwrap();
    assert_eq!(stored.latest_spec, Some(spec));

    assert_eq!(session.handle("one more thing").unwrap(), Outcome::Finished);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(session.handle("show").unwrap(), Outcome::Knowledge { .. }));
}

#[test]
fn test_exit_rejects_further_input() {
    let dir = tempdir().unwrap();
    let mut session = controller(dir.path(), &[]);

    assert_eq!(session.handle("exit").unwrap(), Outcome::Exit);
    assert!(matches!(session.handle("show"), Err(SessionError::Exited)));
    assert!(matches!(session.handle("hi"), Err(SessionError::Exited)));
}

#[test]
fn test_reset_keeps_knowledge() {
    let dir = tempdir().unwrap();
    let mut session = controller(
        dir.path(),
        &[r#"<KNOWLEDGE>["risk: scope creep"]</KNOWLEDGE>ok"#],
    );
    session.handle("risks?").unwrap();
    let before_id = session.session_id();
    let knowledge_path = dir.path().join("knowledge.yaml");
    let before = fs::read(&knowledge_path).unwrap();

    let Outcome::Reset { session_id } = session.handle("reset").unwrap() else {
        panic!("reset must return the new session");
    };
    assert_ne!(session_id, before_id);
    assert!(session.history().is_empty());
    assert!(session.transcript().unwrap().entries.is_empty());
    assert_eq!(fs::read(&knowledge_path).unwrap(), before);
}

#[test]
fn test_model_failure_is_not_fatal() {
    let dir = tempdir().unwrap();
    let config = SessionConfig::new(dir.path().join("k.yaml"), dir.path().join("t.yaml"));
    let mut session = SessionController::open(&config, Box::new(Failing)).unwrap();

    let outcome = session.handle("hello").unwrap();
    assert!(matches!(outcome, Outcome::ModelFailed { ref reason } if reason.contains("no network")));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!config.knowledge_path.exists());
}

#[test]
fn test_end_of_input_acts_as_done() {
    let dir = tempdir().unwrap();
    let mut session = controller(
        dir.path(),
        &[r#"<KNOWLEDGE>["goal: quiz"]</KNOWLEDGE>fine"#],
    );

    let outcomes = session.run(&mut lines(&["start", ""])).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[1], Outcome::Ignored);
    assert!(matches!(outcomes[2], Outcome::Done { .. }));
    assert_eq!(session.state(), SessionState::Terminated);

    let stored = open_knowledge(&dir.path().join("knowledge.yaml"), &StoreConfig::default())
        .read()
        .unwrap();
    assert_eq!(
        stored.latest_spec.map(|s| s.root_goal).as_deref(),
        Some("quiz")
    );
}

#[test]
fn test_run_stops_at_exit_without_drafting() {
    let dir = tempdir().unwrap();
    let mut session = controller(dir.path(), &[]);

    let outcomes = session.run(&mut lines(&["exit", "show"])).unwrap();
    assert_eq!(outcomes, vec![Outcome::Exit]);
    assert!(!dir.path().join("knowledge.yaml").exists());
}

#[test]
fn test_resume_loads_history() {
    let dir = tempdir().unwrap();
    let first_id = {
        let mut session = controller(dir.path(), &["first answer"]);
        session.handle("first question").unwrap();
        session.session_id()
    };

    let config = SessionConfig::new(
        dir.path().join("knowledge.yaml"),
        dir.path().join("transcript.yaml"),
    )
    .resume(true);
    let mut session = open(&config, &["second answer"]);
    assert_eq!(session.session_id(), first_id);
    assert_eq!(session.history().len(), 2);
    assert_eq!(session.history()[0].role, TranscriptRole::User);

    session.handle("second question").unwrap();
    let entries = session.transcript().unwrap().entries;
    assert_eq!(
        entries.iter().map(|e| e.turn_index).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

#[test]
fn test_fresh_start_discards_transcript() {
    let dir = tempdir().unwrap();
    {
        let mut session = controller(dir.path(), &["a"]);
        session.handle("q").unwrap();
    }
    let session = controller(dir.path(), &[]);
    assert!(session.history().is_empty());
    assert!(session.transcript().unwrap().entries.is_empty());
}

// ============================================================================
// Dry run
// ============================================================================

fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, fs::read(&path).unwrap())
        })
        .collect();
    files.sort();
    files
}

fn seed(dir: &Path) {
    let knowledge = open_knowledge(&dir.join("knowledge.yaml"), &StoreConfig::default());
    knowledge
        .append_items(
            &[reqx_core::AppendItem::new(Role::User, "goal: flashcards")],
            fixed_clock(),
        )
        .unwrap();
}

#[test]
fn test_dry_run_matches_real_run_and_touches_nothing() {
    let script = [
        "what should we build?",
        "show",
        "and the risks?",
        "spec",
        "/done Cards",
    ];
    let replies = [
        r#"Noted. <KNOWLEDGE>["feature: decks"]</KNOWLEDGE>"#,
        r#"<KNOWLEDGE>{"append":["risk: sync conflicts", ""]}</KNOWLEDGE>Careful."#,
    ];

    let real_dir = tempdir().unwrap();
    let dry_dir = tempdir().unwrap();
    seed(real_dir.path());
    seed(dry_dir.path());
    let before = snapshot(dry_dir.path());

    let run = |dir: &Path, dry_run: bool| {
        let config = SessionConfig::new(dir.join("knowledge.yaml"), dir.join("transcript.yaml"))
            .dry_run(dry_run);
        open(&config, &replies).run(&mut lines(&script)).unwrap()
    };
    let real = run(real_dir.path(), false);
    let dry = run(dry_dir.path(), true);

    assert_eq!(real, dry);
    assert_eq!(snapshot(dry_dir.path()), before);
    assert_ne!(snapshot(real_dir.path()), before);
}

// ============================================================================
// CoreService
// ============================================================================

#[test]
fn test_service_operations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.db");
    let service = CoreService::default();

    service
        .append(&path, Role::User, &["goal: vocabulary app".into()])
        .unwrap();
    let knowledge = service
        .append(&path, Role::Assistant, &["feature: spaced repetition".into()])
        .unwrap();
    assert_eq!(
        knowledge.items.iter().map(|i| i.sequence).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(service.read(&path).unwrap(), knowledge);

    let named = service.set_project_name(&path, "Vocab").unwrap();
    assert_eq!(named.project_name.as_deref(), Some("Vocab"));

    let draft = service.generate_spec(&path).unwrap();
    assert_eq!(draft.root_goal, "vocabulary app");
    assert_eq!(draft.proposed_solutions, vec!["spaced repetition".to_string()]);
    assert_eq!(service.read(&path).unwrap().latest_spec, None);

    let stored = service.generate_and_store_spec(&path).unwrap();
    assert_eq!(service.read(&path).unwrap().latest_spec, Some(stored));
}

#[test]
fn test_service_extract_uses_its_tag() {
    let service = CoreService::default().with_extractor(TagExtractor::with_tag("TAG"));
    let out = service.extract(r#"Sure. <TAG>{"append":["x"]}</TAG> Done."#);
    assert_eq!(out.display_text, "Sure.  Done.");
    assert_eq!(out.items.len(), 1);
}

#[test]
fn test_service_transcripts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.yaml");
    let service = CoreService::default();

    let id = service.start_transcript(&path, false).unwrap();
    service
        .append_transcript(id, TranscriptRole::User, "hello")
        .unwrap();
    assert_eq!(
        service.append_transcript(id, TranscriptRole::Assistant, "   ").unwrap(),
        None
    );
    let entries = service.read_transcript(&path).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].turn_index, 1);
}

#[test]
fn test_service_dry_run_keeps_writes_in_memory() {
    let dir = tempdir().unwrap();
    let knowledge_path = dir.path().join("k.yaml");
    let transcript_path = dir.path().join("t.db");
    let service = CoreService::default().dry_run(true);

    service
        .append(&knowledge_path, Role::User, &["goal: a".into()])
        .unwrap();
    let knowledge = service
        .append(&knowledge_path, Role::User, &["goal: b".into()])
        .unwrap();
    assert_eq!(knowledge.items.len(), 2);
    assert_eq!(service.read(&knowledge_path).unwrap(), knowledge);
    service.generate_and_store_spec(&knowledge_path).unwrap();

    let id = service.start_transcript(&transcript_path, false).unwrap();
    service
        .append_transcript(id, TranscriptRole::User, "hi")
        .unwrap();
    assert_eq!(service.read_transcript(&transcript_path).unwrap().len(), 1);

    assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    assert_eq!(
        CoreService::default().read(&knowledge_path).unwrap(),
        ProjectKnowledge::empty()
    );
}

#[test]
fn test_service_dry_run_on_unreadable_yaml_matches_real_run() {
    const BROKEN: &str = "schema_version: 2\nitems: [ {{{ not yaml";
    let real_dir = tempdir().unwrap();
    let dry_dir = tempdir().unwrap();
    for dir in [real_dir.path(), dry_dir.path()] {
        fs::write(dir.join("k.yaml"), BROKEN).unwrap();
        fs::write(dir.join("t.yaml"), BROKEN).unwrap();
    }

    let exercise = |dir: &Path, dry_run: bool| {
        let service = CoreService::default().dry_run(dry_run);
        let knowledge = dir.join("k.yaml");
        let transcript = dir.join("t.yaml");
        assert!(service.read(&knowledge).is_err());

        let after = service
            .append(&knowledge, Role::User, &["goal: recover".into()])
            .unwrap();
        let id = service.start_transcript(&transcript, false).unwrap();
        service
            .append_transcript(id, TranscriptRole::User, "hello")
            .unwrap();
        (
            after
                .items
                .iter()
                .map(|i| (i.sequence, i.text.clone()))
                .collect::<Vec<_>>(),
            service.read(&knowledge).unwrap().items.len(),
            service.read_transcript(&transcript).unwrap().len(),
        )
    };

    let dry_before = snapshot(dry_dir.path());
    let real = exercise(real_dir.path(), false);
    let dry = exercise(dry_dir.path(), true);

    assert_eq!(real, dry);
    assert_eq!(real.0, vec![(1, "goal: recover".to_string())]);
    assert_eq!(snapshot(dry_dir.path()), dry_before);
}

#[test]
fn test_dry_run_on_unreadable_sqlite_still_refuses() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.db");
    fs::write(&path, b"definitely not a database file, just some bytes to fail the header")
        .unwrap();

    let real = CoreService::default().append(&path, Role::User, &["x".into()]);
    let dry = CoreService::default()
        .dry_run(true)
        .append(&path, Role::User, &["x".into()]);
    assert!(real.is_err());
    assert!(dry.is_err());
}
