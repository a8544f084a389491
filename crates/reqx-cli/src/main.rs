//! Reqx CLI
//!
//! Thin command-line wrapper over the requirement-excavation core:
//! - Splitting model replies into display text and knowledge items
//! - Reading and appending to knowledge stores (`.yaml` or `.db`)
//! - Drafting specifications from stored knowledge
//! - Replaying scripted conversations against real stores
//!
//! Results go to stdout as JSON. Logs and status lines go to stderr.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use reqx_core::{Role, TagExtractor, DEFAULT_TAG};
use reqx_session::{CoreService, ScriptedReplies, SessionConfig, SessionController};
use reqx_storage::StoreConfig;
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "reqx")]
#[command(author, version, about = "Reqx: requirement excavation from conversations")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Keep every store mutation in memory; no file is created or modified
    #[arg(long, global = true)]
    dry_run: bool,

    /// How long to wait for another writer before giving up
    #[arg(long, global = true, default_value_t = 250)]
    lock_timeout_ms: u64,

    /// Raise log verbosity (-v debug, -vv trace). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl GlobalArgs {
    fn store_config(&self) -> StoreConfig {
        StoreConfig::default().with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Split a model reply into display text and knowledge items
    Extract {
        /// File holding the reply; stdin when omitted or `-`
        input: Option<PathBuf>,
        /// Marker tag of embedded blocks
        #[arg(long, default_value = DEFAULT_TAG)]
        tag: String,
    },

    /// Knowledge store operations
    Knowledge {
        #[command(subcommand)]
        command: KnowledgeCommands,
    },

    /// Draft a specification from a knowledge store
    Spec {
        #[arg(long)]
        store: PathBuf,
        /// Also store the document as the latest specification
        #[arg(long)]
        done: bool,
    },

    /// Transcript operations
    Transcript {
        #[command(subcommand)]
        command: TranscriptCommands,
    },

    /// Run a conversation: lines from stdin, replies from a script
    Chat {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        transcript: PathBuf,
        /// Continue the existing transcript instead of starting fresh
        #[arg(long)]
        resume: bool,
        /// JSON Lines file; each line is a reply string or `{"reply": "..."}`
        #[arg(long)]
        replies: PathBuf,
        #[arg(long, default_value = DEFAULT_TAG)]
        tag: String,
    },
}

#[derive(Subcommand)]
enum KnowledgeCommands {
    /// Print the store
    Read {
        #[arg(long)]
        store: PathBuf,
    },
    /// Append items in one atomic write
    Append {
        #[arg(long)]
        store: PathBuf,
        /// user, assistant, or system
        #[arg(long, default_value = "user")]
        role: Role,
        /// Item texts; blank ones are ignored
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Set the project name; an empty name clears it
    SetName {
        #[arg(long)]
        store: PathBuf,
        name: String,
    },
}

#[derive(Subcommand)]
enum TranscriptCommands {
    /// Print every entry in turn order
    Read {
        #[arg(long)]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let global = cli.global;
    if global.dry_run {
        eprintln!(
            "{} {}",
            "dry run:".yellow().bold(),
            "stores are read but never written"
        );
    }
    let service = CoreService::new(global.store_config()).dry_run(global.dry_run);

    match cli.command {
        Commands::Extract { input, tag } => {
            let reply = read_input(input.as_deref())?;
            let service = service.with_extractor(TagExtractor::with_tag(&tag));
            emit(&service.extract(&reply))?;
        }
        Commands::Knowledge { command } => match command {
            KnowledgeCommands::Read { store } => {
                emit(&service.read(&store).with_context(|| at(&store))?)?;
            }
            KnowledgeCommands::Append { store, role, items } => {
                let knowledge = service
                    .append(&store, role, &items)
                    .with_context(|| at(&store))?;
                emit(&knowledge)?;
            }
            KnowledgeCommands::SetName { store, name } => {
                let knowledge = service
                    .set_project_name(&store, &name)
                    .with_context(|| at(&store))?;
                emit(&knowledge)?;
            }
        },
        Commands::Spec { store, done } => {
            let spec = if done {
                service.generate_and_store_spec(&store)
            } else {
                service.generate_spec(&store)
            }
            .with_context(|| at(&store))?;
            if !spec.is_valid() {
                eprintln!(
                    "{} {} validation error(s)",
                    "warning:".yellow().bold(),
                    spec.validation_errors.len()
                );
            }
            emit(&spec)?;
        }
        Commands::Transcript { command } => match command {
            TranscriptCommands::Read { path } => {
                emit(&service.read_transcript(&path).with_context(|| at(&path))?)?;
            }
        },
        Commands::Chat {
            store,
            transcript,
            resume,
            replies,
            tag,
        } => {
            let config = SessionConfig::new(store, transcript)
                .resume(resume)
                .dry_run(global.dry_run)
                .tag(tag)
                .store(global.store_config());
            cmd_chat(&config, &replies)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "warn,reqx_core=debug,reqx_storage=debug,reqx_session=debug",
        _ => "debug,reqx_core=trace,reqx_storage=trace,reqx_session=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(true),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn at(path: &Path) -> String {
    format!("store {}", path.display())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(path) if path != Path::new("-") => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("failed to read stdin")?;
            Ok(text)
        }
    }
}

// ============================================================================
// chat
// ============================================================================

fn cmd_chat(config: &SessionConfig, replies: &Path) -> Result<()> {
    let script = load_replies(replies)?;
    let count = script.len();
    let mut session =
        SessionController::open(config, Box::new(ScriptedReplies::new(script)))
            .with_context(|| at(&config.knowledge_path))?;
    eprintln!(
        "{} session {} ({} scripted replies)",
        "chat".green().bold(),
        session.session_id().to_string().bold(),
        count
    );

    let mut lines = io::stdin().lock().lines().map_while(|l| l.ok());
    let mut failed = None;
    session.run_with(&mut lines, &mut |outcome| {
        if failed.is_some() {
            return;
        }
        match serde_json::to_string(&outcome) {
            Ok(json) => println!("{json}"),
            Err(e) => failed = Some(e),
        }
    })?;
    if let Some(e) = failed {
        return Err(anyhow!(e).context("failed to encode outcome"));
    }
    Ok(())
}

/// Replies for [`ScriptedReplies`], one JSON value per non-blank line
fn load_replies(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read replies from {}", path.display()))?;
    parse_replies(&text).with_context(|| format!("in {}", path.display()))
}

fn parse_replies(text: &str) -> Result<Vec<String>> {
    let mut replies = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("line {}: not JSON", index + 1))?;
        let reply = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Object(mut map) => match map.remove("reply") {
                Some(serde_json::Value::String(s)) => s,
                _ => bail!("line {}: object without a string `reply`", index + 1),
            },
            other => bail!("line {}: expected string or object, found {other}", index + 1),
        };
        replies.push(reply);
    }
    Ok(replies)
}
