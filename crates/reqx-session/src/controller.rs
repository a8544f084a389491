//! Session controller
//!
//! ```text
//!            ┌──────────────── command action ───────────────┐
//!            │                                                ▼
//!   Idle ──► Dispatching ──► Extracting ──► (append, record) ──► Idle
//!                │
//!                ├── done ──► Terminated   (free text now gets Finished)
//!                └── exit ──► Exited       (all input rejected)
//! ```
//!
//! Reserved commands never reach the model or the extractor.

use crate::{
    knowledge_backend, transcript_backend, ModelError, ReplyModel, Result, SessionConfig,
    SessionError,
};
use chrono::{DateTime, Utc};
use reqx_core::{
    normalize_at, ExtractionWarning, KeyedItemDrafter, KnowledgeItem, ProjectKnowledge,
    SessionId, SpecDocument, SpecDrafter, TagExtractor, TranscriptRole, TranscriptSession,
};
use reqx_storage::{KnowledgeBackend, StoreConfig, TranscriptBackend, TranscriptStore};
use serde::Serialize;
use std::sync::Arc;

pub const HELP_TEXT: &str = "\
Commands (a leading / is optional):
  show           print the stored knowledge
  spec           draft a specification from the stored knowledge
  done [name]    draft, store the specification, and finish (optionally naming the project)
  reset          start the transcript over; knowledge is kept
  exit | quit    leave without drafting
  help | h | ?   this text
Anything else is sent to the model.";

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Show,
    Spec,
    Done(Option<String>),
    Reset,
    Exit,
    Help,
}

/// Recognize a reserved command.
///
/// Matching is case-insensitive. Only `done` takes an argument, and only in
/// the slash form (`/done Vocab Trainer`), so ordinary sentences that start
/// with a command word stay free text.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    let (slashed, body) = match trimmed.strip_prefix('/') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };
    let (word, rest) = match body.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (body, ""),
    };
    if !rest.is_empty() && !slashed {
        return None;
    }

    let bare = rest.is_empty();
    match word.to_ascii_lowercase().as_str() {
        "show" if bare => Some(Command::Show),
        "spec" if bare => Some(Command::Spec),
        "done" => Some(Command::Done((!bare).then(|| rest.to_string()))),
        "reset" if bare => Some(Command::Reset),
        "exit" | "quit" if bare => Some(Command::Exit),
        "help" | "h" | "?" if bare => Some(Command::Help),
        _ => None,
    }
}

// ============================================================================
// State and outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Dispatching,
    Extracting,
    Terminated,
    Exited,
}

/// What one input line produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome {
    Knowledge {
        knowledge: ProjectKnowledge,
    },
    Spec {
        spec: SpecDocument,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        spec: SpecDocument,
        project_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Reset {
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    Reply {
        display_text: String,
        appended: Vec<KnowledgeItem>,
        warnings: Vec<ExtractionWarning>,
    },
    Help {
        text: String,
    },
    /// Free text after `done`
    Finished,
    ModelFailed {
        reason: String,
    },
    Exit,
    /// Blank input
    Ignored,
}

/// A turn of conversation as the model sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: TranscriptRole,
    pub content: String,
}

/// What a [`ReplyModel`] gets to work with
#[derive(Debug)]
pub struct ChatContext<'a> {
    /// Conversation so far, ending with the user's latest turn
    pub history: &'a [ChatTurn],
    pub knowledge: &'a ProjectKnowledge,
    /// Marker pair the model should wrap decisions in
    pub open_marker: &'a str,
    pub close_marker: &'a str,
}

impl ChatContext<'_> {
    pub fn latest_user_input(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|t| t.role == TranscriptRole::User)
            .map(|t| t.content.as_str())
    }
}

/// Line-oriented input. Any iterator of lines works.
pub trait InputSource {
    fn next_line(&mut self) -> Option<String>;
}

impl<I> InputSource for I
where
    I: Iterator<Item = String>,
{
    fn next_line(&mut self) -> Option<String> {
        self.next()
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct SessionController {
    knowledge: Arc<dyn KnowledgeBackend>,
    transcript: Arc<dyn TranscriptBackend>,
    transcripts: TranscriptStore,
    session_id: SessionId,
    model: Box<dyn ReplyModel>,
    extractor: TagExtractor,
    drafter: Box<dyn SpecDrafter>,
    history: Vec<ChatTurn>,
    state: SessionState,
    clock: fn() -> DateTime<Utc>,
}

impl SessionController {
    /// Open both stores and start the transcript session
    pub fn open(config: &SessionConfig, model: Box<dyn ReplyModel>) -> Result<Self> {
        let knowledge = knowledge_backend(&config.knowledge_path, &config.store, config.dry_run)?;
        let transcript =
            transcript_backend(&config.transcript_path, &config.store, config.dry_run)?;
        let controller =
            Self::with_backends(knowledge, transcript, config.store, model, config.resume)?
                .with_extractor(TagExtractor::with_tag(&config.tag));
        tracing::debug!(
            knowledge = %config.knowledge_path.display(),
            transcript = %config.transcript_path.display(),
            dry_run = config.dry_run,
            resume = config.resume,
            "session opened"
        );
        Ok(controller)
    }

    /// Build a controller over explicit backends
    pub fn with_backends(
        knowledge: Arc<dyn KnowledgeBackend>,
        transcript: Arc<dyn TranscriptBackend>,
        store: StoreConfig,
        model: Box<dyn ReplyModel>,
        resume: bool,
    ) -> Result<Self> {
        let mut controller = Self {
            knowledge,
            transcript,
            transcripts: TranscriptStore::new(store),
            session_id: SessionId::nil(),
            model,
            extractor: TagExtractor::new(),
            drafter: Box::new(KeyedItemDrafter::new()),
            history: Vec::new(),
            state: SessionState::Idle,
            clock: Utc::now,
        };
        controller.start(resume)?;
        Ok(controller)
    }

    pub fn with_drafter(mut self, drafter: Box<dyn SpecDrafter>) -> Self {
        self.drafter = drafter;
        self
    }

    pub fn with_extractor(mut self, extractor: TagExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Fix the time source for stored timestamps and `generatedAt`
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn transcript(&self) -> Result<TranscriptSession> {
        Ok(self.transcripts.session(self.session_id)?)
    }

    fn start(&mut self, resume: bool) -> Result<()> {
        self.session_id = self
            .transcripts
            .start_session_with(Arc::clone(&self.transcript), resume)?;
        self.history = if resume {
            self.transcripts
                .session(self.session_id)?
                .entries
                .into_iter()
                .map(|e| ChatTurn {
                    role: e.role,
                    content: e.content,
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(())
    }

    /// Handle one line of input
    pub fn handle(&mut self, line: &str) -> Result<Outcome> {
        let resting = match self.state {
            SessionState::Exited => return Err(SessionError::Exited),
            SessionState::Terminated => SessionState::Terminated,
            _ => SessionState::Idle,
        };
        self.state = SessionState::Dispatching;

        let result = self.dispatch(line, resting);
        if matches!(
            self.state,
            SessionState::Dispatching | SessionState::Extracting
        ) {
            self.state = resting;
        }
        tracing::debug!(state = ?self.state, ok = result.is_ok(), "input handled");
        result
    }

    fn dispatch(&mut self, line: &str, resting: SessionState) -> Result<Outcome> {
        if let Some(command) = parse_command(line) {
            tracing::debug!(?command, "command");
            return self.command(command);
        }
        if line.trim().is_empty() {
            return Ok(Outcome::Ignored);
        }
        if resting == SessionState::Terminated {
            return Ok(Outcome::Finished);
        }
        self.converse(line)
    }

    fn command(&mut self, command: Command) -> Result<Outcome> {
        match command {
            Command::Help => Ok(Outcome::Help {
                text: HELP_TEXT.to_string(),
            }),
            Command::Show => Ok(Outcome::Knowledge {
                knowledge: self.knowledge.read()?,
            }),
            Command::Spec => Ok(Outcome::Spec {
                spec: self.draft_spec()?,
            }),
            Command::Done(name) => {
                if let Some(name) = name.as_deref() {
                    self.knowledge.set_project_name(name)?;
                }
                let spec = self.draft_spec()?;
                let knowledge = self.knowledge.set_latest_spec(&spec)?;
                self.state = SessionState::Terminated;
                Ok(Outcome::Done {
                    spec,
                    project_name: knowledge.project_name,
                })
            }
            Command::Reset => {
                self.start(false)?;
                Ok(Outcome::Reset {
                    session_id: self.session_id,
                })
            }
            Command::Exit => {
                self.state = SessionState::Exited;
                Ok(Outcome::Exit)
            }
        }
    }

    fn draft_spec(&self) -> Result<SpecDocument> {
        let knowledge = self.knowledge.read()?;
        Ok(normalize_at(&self.drafter.draft(&knowledge), (self.clock)()))
    }

    fn record(&self, role: TranscriptRole, content: &str) -> Result<()> {
        self.transcripts
            .append_at(self.session_id, role, content, (self.clock)())?;
        Ok(())
    }

    fn converse(&mut self, line: &str) -> Result<Outcome> {
        let input = line.trim();
        self.record(TranscriptRole::User, input)?;
        self.history.push(ChatTurn {
            role: TranscriptRole::User,
            content: input.to_string(),
        });

        let knowledge = self.knowledge.read()?;
        let context = ChatContext {
            history: &self.history,
            knowledge: &knowledge,
            open_marker: self.extractor.open_marker(),
            close_marker: self.extractor.close_marker(),
        };
        let reply = match self.model.reply(&context) {
            Ok(reply) => reply,
            Err(e) => return Ok(self.model_failed(e)),
        };

        self.state = SessionState::Extracting;
        let extraction = self.extractor.extract(&reply);
        let appended = if extraction.items.is_empty() {
            Vec::new()
        } else {
            let after = self
                .knowledge
                .append_items(&extraction.items, (self.clock)())?;
            let start = after.items.len().saturating_sub(extraction.items.len());
            after.items[start..].to_vec()
        };

        self.record(TranscriptRole::Assistant, &extraction.display_text)?;
        self.history.push(ChatTurn {
            role: TranscriptRole::Assistant,
            content: extraction.display_text.clone(),
        });

        Ok(Outcome::Reply {
            display_text: extraction.display_text,
            appended,
            warnings: extraction.warnings,
        })
    }

    fn model_failed(&self, error: ModelError) -> Outcome {
        tracing::warn!(session = %self.session_id, %error, "model call failed");
        Outcome::ModelFailed {
            reason: error.to_string(),
        }
    }

    /// Drive the session until input ends, `done`, or `exit`.
    ///
    /// End of input acts as `done` unless the session already finished.
    pub fn run(&mut self, input: &mut dyn InputSource) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        self.run_with(input, &mut |outcome| outcomes.push(outcome))?;
        Ok(outcomes)
    }

    /// [`run`](Self::run), handing each outcome to `sink` as soon as it exists
    pub fn run_with(
        &mut self,
        input: &mut dyn InputSource,
        sink: &mut dyn FnMut(Outcome),
    ) -> Result<()> {
        while let Some(line) = input.next_line() {
            sink(self.handle(&line)?);
            if matches!(self.state, SessionState::Terminated | SessionState::Exited) {
                return Ok(());
            }
        }
        tracing::debug!(session = %self.session_id, "input ended, finishing");
        sink(self.handle("done")?);
        Ok(())
    }
}
