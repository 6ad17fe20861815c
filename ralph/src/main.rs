//! `ralph`: drive a non-interactive coding agent through a task queue until
//! every task is verified complete or the loop budget runs out.

use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::warn;

use ralph::controller::{LoopEnv, LoopEvent, run_session};
use ralph::core::classifier::preview;
use ralph::core::session::Session;
use ralph::core::task_queue::parse_tasks;
use ralph::core::types::{FinishReason, FinishRecord};
use ralph::exit_codes;
use ralph::io::audit::{AuditLog, Finalizer};
use ralph::io::config::resolve_config;
use ralph::io::executor::AgentExecutor;
use ralph::io::git::Git;
use ralph::io::interrupt::{CancelToken, ForceShutdown, SHUTDOWN_GRACE, install_handler};
use ralph::io::state_files::{SessionPaths, StateFiles};
use ralph::io::status::StatusWriter;
use ralph::io::tools::ToolRegistry;
use ralph::io::transcript::TranscriptStore;

/// Task file read when no other input is given.
const PROMPT_FILE: &str = "PROMPT.md";

#[derive(Parser, Debug)]
#[command(
    name = "ralph",
    version,
    about = "Run a coding agent against a task queue until every task is verified complete"
)]
struct Cli {
    /// Optional agent name (claude, gemini, copilot, codex, or a configured
    /// tool) followed by the task text.
    #[arg(value_name = "AGENT|TASK")]
    words: Vec<String>,

    /// Loop budget: total agent invocations across all tasks.
    #[arg(
        short = 'n',
        long,
        default_value_t = 50,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    max_iterations: u32,

    /// Keep transcripts from earlier runs instead of clearing them.
    #[arg(long)]
    keep_logs: bool,

    /// Agent tool to run.
    #[arg(short, long)]
    agent: Option<String>,

    /// Read tasks from a file.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Write machine-readable JSON status events to this file.
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Config file (defaults to `ralph.toml` in the working directory).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    ralph::logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            if !err.use_stderr() {
                err.exit();
            }
            // Best effort: the exit code carries the failure.
            let _ = err.print();
            process::exit(exit_codes::INVALID);
        }
    };
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("ralph: {:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let workdir = std::env::current_dir().context("resolve working directory")?;
    let config = resolve_config(cli.config.as_deref(), &workdir)?;
    let registry = ToolRegistry::with_overrides(&config.tools)?;
    let (tool, words) = split_tool(
        &registry,
        cli.agent.as_deref(),
        &cli.words,
        &config.default_agent,
    );
    let executor = AgentExecutor::from_registry(&registry, &tool)?;
    let raw = read_task_input(cli.file.as_deref(), &words, &workdir)?;
    let tasks = parse_tasks(&raw)?;
    let mut session = Session::new(tasks, tool.as_str(), cli.max_iterations, Utc::now());

    let paths = SessionPaths::new(&workdir, &config.session_dir);
    let state = StateFiles::new(
        paths,
        Git::new(&workdir),
        config.completion_token.as_str(),
        config.preview_chars,
        config.context_diff_lines,
    )?;
    let transcripts = TranscriptStore::open(&state.paths().attempts, cli.keep_logs);
    let audit = Arc::new(AuditLog::new(workdir.join(&config.audit_log)));
    let status = cli
        .status_file
        .map(|path| Arc::new(StatusWriter::new(path, tool.as_str())));
    let finalizer = Arc::new(Finalizer::new(Arc::clone(&audit), status.clone()));

    let cancel = CancelToken::new();
    if let Err(err) = install_handler(cancel.clone(), force_shutdown(&finalizer), SHUTDOWN_GRACE) {
        warn!(err = %format!("{err:#}"), "signals will not stop the session cleanly");
    }

    eprintln!(
        "ralph: agent {tool}, {} tasks ({} open), budget {} iterations",
        session.tasks().len(),
        session.remaining_tasks(),
        session.max_iterations()
    );
    let env = LoopEnv {
        workdir: workdir.clone(),
        pause: Duration::from_millis(config.pause_ms),
        preview_chars: config.preview_chars,
        state: &state,
        transcripts: &transcripts,
        audit: &audit,
        status: status.as_deref(),
        finalizer: &finalizer,
        cancel: &cancel,
    };
    let preview_chars = config.preview_chars;
    let reason = run_session(&mut session, &executor, &env, |event| {
        print_event(event, preview_chars);
    })?;
    Ok(reason.exit_code())
}

/// Shutdown path for the signal handler: record the interruption unless the
/// session already finished, then exit with the code of whichever stands.
fn force_shutdown(finalizer: &Arc<Finalizer>) -> ForceShutdown {
    let finalizer = Arc::clone(finalizer);
    Arc::new(move || {
        let (reason, _) = finalizer.settle(&FinishRecord {
            reason: FinishReason::Interrupted,
            note: "forced shutdown after interrupt".to_string(),
            at: Utc::now(),
        });
        process::exit(reason.exit_code());
    })
}

/// Pick the agent and the task words.
///
/// The first positional names the agent only when it is a known tool and no
/// `--agent` was given; otherwise every positional is task text.
fn split_tool(
    registry: &ToolRegistry,
    explicit: Option<&str>,
    words: &[String],
    default_agent: &str,
) -> (String, Vec<String>) {
    if let Some(name) = explicit {
        return (name.to_string(), words.to_vec());
    }
    match words.split_first() {
        Some((first, rest)) if registry.contains(first) => (first.clone(), rest.to_vec()),
        _ => (default_agent.to_string(), words.to_vec()),
    }
}

/// Task text from `--file`, positionals, piped stdin, or `PROMPT.md`, in that order.
fn read_task_input(file: Option<&Path>, words: &[String], workdir: &Path) -> Result<String> {
    if let Some(path) = file {
        return fs::read_to_string(path)
            .with_context(|| format!("read task file {}", path.display()));
    }
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        let mut piped = String::new();
        stdin
            .lock()
            .read_to_string(&mut piped)
            .context("read tasks from stdin")?;
        if !piped.trim().is_empty() {
            return Ok(piped);
        }
    }
    let fallback = workdir.join(PROMPT_FILE);
    if fallback.is_file() {
        return fs::read_to_string(&fallback)
            .with_context(|| format!("read {}", fallback.display()));
    }
    bail!("no tasks given: pass task text, --file, piped stdin, or create {PROMPT_FILE}")
}

fn print_event(event: &LoopEvent, preview_chars: usize) {
    match event {
        LoopEvent::AttemptStarted {
            iteration,
            max_iterations,
            task_number,
            total_tasks,
            task_attempt,
            description,
            mutation,
        } => {
            eprintln!(
                "==> iteration {iteration}/{max_iterations}: task {task_number}/{total_tasks} attempt {task_attempt}: {}",
                preview(description, preview_chars)
            );
            if *task_attempt > 1 {
                eprintln!("    {}", preview(mutation, preview_chars));
            }
        }
        LoopEvent::TaskCompleted {
            task_number,
            duration_ms,
            remaining,
            ..
        } => {
            eprintln!(
                "<== task {task_number} complete in {duration_ms} ms ({remaining} remaining)"
            );
        }
        LoopEvent::AttemptFailed {
            exit_code,
            duration_ms,
            signature,
            streak,
            ..
        } => {
            eprintln!(
                "<== attempt failed: exit {exit_code} in {duration_ms} ms: {} (streak {streak})",
                preview(signature, preview_chars)
            );
        }
        LoopEvent::AttemptInterrupted { task_number, .. } => {
            eprintln!("<== attempt on task {task_number} interrupted");
        }
        LoopEvent::Finished { reason, note } => {
            eprintln!("ralph: {}: {note}", reason.as_str());
        }
    }
}
