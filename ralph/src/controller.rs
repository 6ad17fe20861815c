//! The session loop: run the agent against the task queue until every task
//! is verified complete, the budget runs out, or the session is interrupted.
//!
//! Each iteration materializes the session files, invokes the agent with the
//! stable prompt, classifies the outcome, writes a transcript and updates the
//! [`Session`]. Only [`Session`] methods mutate counters; this module wires
//! them to the I/O collaborators.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::{info, instrument, warn};

use crate::core::classifier::{Verdict, classify, preview};
use crate::core::session::{AttemptStart, Session};
use crate::core::types::{ExecOutcome, FinishReason};
use crate::io::audit::{AuditLog, Finalizer};
use crate::io::executor::{ExecRequest, Executor, attempt_env};
use crate::io::interrupt::CancelToken;
use crate::io::prompt::PromptPack;
use crate::io::state_files::StateFiles;
use crate::io::status::{StatusKind, StatusWriter};
use crate::io::transcript::{AttemptOutcome, TranscriptEntry, TranscriptStore};

/// Collaborators and settings shared by every iteration.
pub struct LoopEnv<'a> {
    /// Working directory the agent runs in.
    pub workdir: PathBuf,
    /// Pause between attempts (cancellable).
    pub pause: Duration,
    /// Display truncation for console and audit previews.
    pub preview_chars: usize,
    pub state: &'a StateFiles,
    pub transcripts: &'a TranscriptStore,
    pub audit: &'a AuditLog,
    pub status: Option<&'a StatusWriter>,
    pub finalizer: &'a Finalizer,
    pub cancel: &'a CancelToken,
}

/// Progress notifications for the caller (console output).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    AttemptStarted {
        iteration: u32,
        max_iterations: u32,
        task_number: usize,
        total_tasks: usize,
        task_attempt: u32,
        description: String,
        mutation: String,
    },
    TaskCompleted {
        iteration: u32,
        task_number: usize,
        task_attempt: u32,
        duration_ms: u64,
        remaining: usize,
    },
    AttemptFailed {
        iteration: u32,
        task_number: usize,
        task_attempt: u32,
        exit_code: i32,
        duration_ms: u64,
        signature: String,
        streak: u32,
    },
    AttemptInterrupted {
        iteration: u32,
        task_number: usize,
    },
    Finished {
        reason: FinishReason,
        note: String,
    },
}

/// Run the session to a terminal state and finalize it.
///
/// Agent failures, spawn failures and file write failures never end the loop;
/// only completion, the budget, or cancellation do.
#[instrument(skip_all, fields(tool = %session.tool(), tasks = session.tasks().len()))]
pub fn run_session<E: Executor, F: FnMut(&LoopEvent)>(
    session: &mut Session,
    executor: &E,
    env: &LoopEnv<'_>,
    mut on_event: F,
) -> Result<FinishReason> {
    let prompt = PromptPack::build(
        env.state.renderer(),
        env.state.paths().refs(),
        env.state.token(),
    )?;
    env.audit.record(&format!(
        "session started: agent={} tasks={} remaining={} budget={} prompt={}",
        session.tool(),
        session.tasks().len(),
        session.remaining_tasks(),
        session.max_iterations(),
        prompt.hash()
    ));
    env.state.ensure_dirs();
    env.state.ensure_environment(Utc::now());

    while session.should_continue() {
        if env.cancel.is_cancelled() {
            break;
        }
        let keep_going = run_attempt(session, executor, env, &prompt, &mut on_event)?;
        if !keep_going {
            break;
        }
        if session.should_continue() && env.cancel.sleep(env.pause) {
            break;
        }
    }

    let reason = if env.cancel.is_cancelled() && !session.is_complete() {
        FinishReason::Interrupted
    } else {
        session.natural_finish()
    };
    let note = finish_note(session, reason);
    let now = Utc::now();
    session.finish(reason, note.clone(), now);
    env.state.write_progress(session, now);
    if let Some(record) = session.finish_record() {
        env.finalizer.finalize(record);
    }
    info!(reason = reason.as_str(), iterations = session.iteration(), "session finished");
    on_event(&LoopEvent::Finished { reason, note });
    Ok(reason)
}

/// One attempt on the current task. Returns `false` when it was interrupted.
fn run_attempt<E: Executor, F: FnMut(&LoopEvent)>(
    session: &mut Session,
    executor: &E,
    env: &LoopEnv<'_>,
    prompt: &PromptPack,
    on_event: &mut F,
) -> Result<bool> {
    let started = Utc::now();
    let start = session.begin_attempt(started)?;
    let mutation = session.mutation_note();
    let description = session
        .current_task()
        .map(|task| task.description.clone())
        .unwrap_or_default();
    let task_number = start.task_index + 1;
    let total_tasks = session.tasks().len();
    let tool = session.tool().to_string();

    env.state.materialize_all(session, started);
    env.audit.record(&format!(
        "iteration {}/{}: task {}/{} attempt {}: {}",
        start.iteration,
        session.max_iterations(),
        task_number,
        total_tasks,
        start.task_attempt,
        preview(&description, env.preview_chars)
    ));
    env.audit.record(&format!("mutation: {mutation}"));
    if let Some(status) = env.status {
        status.emit(
            StatusKind::IterationStart,
            start.iteration,
            Some(format!("task {task_number}/{total_tasks} attempt {}", start.task_attempt)),
        );
    }
    on_event(&LoopEvent::AttemptStarted {
        iteration: start.iteration,
        max_iterations: session.max_iterations(),
        task_number,
        total_tasks,
        task_attempt: start.task_attempt,
        description: description.clone(),
        mutation: mutation.clone(),
    });

    let request = ExecRequest {
        workdir: env.workdir.clone(),
        prompt: prompt.content().to_string(),
        env: attempt_env(&start),
    };
    let outcome = match executor.exec(&request, env.cancel) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent could not be run");
            ExecOutcome {
                stderr: format!("{err:#}"),
                exit_code: -1,
                ..ExecOutcome::default()
            }
        }
    };
    let finished = Utc::now();

    let record = |result: AttemptOutcome, signature: Option<&str>| {
        env.transcripts.write(
            env.state.renderer(),
            &TranscriptEntry {
                timestamp: started.to_rfc3339_opts(SecondsFormat::Secs, true),
                tool: &tool,
                iteration: start.iteration,
                task_number,
                task_attempt: start.task_attempt,
                task: &description,
                prompt: prompt.content(),
                prompt_hash: prompt.hash(),
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                outcome: result,
                signature,
                mutation: &mutation,
                stdout: &outcome.stdout,
                stderr: &outcome.stderr,
            },
        );
    };

    match classify(&outcome, env.state.token()) {
        Verdict::Success => {
            record(AttemptOutcome::Success, None);
            session.record_success(finished);
            let remaining = session.remaining_tasks();
            env.audit.record(&format!(
                "task {task_number} completed on attempt {} ({} ms); {remaining} remaining",
                start.task_attempt, outcome.duration_ms
            ));
            emit(env, StatusKind::TaskComplete, &start, format!("task {task_number} complete"));
            env.state.refresh(session, finished);
            on_event(&LoopEvent::TaskCompleted {
                iteration: start.iteration,
                task_number,
                task_attempt: start.task_attempt,
                duration_ms: outcome.duration_ms,
                remaining,
            });
            Ok(true)
        }
        Verdict::Failure(_) if outcome.interrupted || env.cancel.is_cancelled() => {
            record(AttemptOutcome::Interrupted, None);
            env.audit.record(&format!(
                "attempt {} on task {task_number} interrupted after {} ms",
                start.task_attempt, outcome.duration_ms
            ));
            on_event(&LoopEvent::AttemptInterrupted {
                iteration: start.iteration,
                task_number,
            });
            Ok(false)
        }
        Verdict::Failure(report) => {
            record(AttemptOutcome::Failure, Some(&report.signature));
            let signature = report.signature.clone();
            let streak = session.record_failure(
                &start,
                prompt.content(),
                &outcome,
                report,
                mutation.clone(),
                finished,
            );
            let shown = preview(&signature, env.preview_chars);
            env.audit.record(&format!(
                "attempt {} on task {task_number} failed: exit {} in {} ms, signature `{shown}` (streak {streak})",
                start.task_attempt, outcome.exit_code, outcome.duration_ms
            ));
            emit(env, StatusKind::IterationEnd, &start, shown);
            env.state.refresh(session, finished);
            on_event(&LoopEvent::AttemptFailed {
                iteration: start.iteration,
                task_number,
                task_attempt: start.task_attempt,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                signature,
                streak,
            });
            Ok(true)
        }
    }
}

fn emit(env: &LoopEnv<'_>, kind: StatusKind, start: &AttemptStart, message: String) {
    if let Some(status) = env.status {
        status.emit(kind, start.iteration, Some(message));
    }
}

fn finish_note(session: &Session, reason: FinishReason) -> String {
    let total = session.tasks().len();
    match reason {
        FinishReason::Succeeded => format!("all {total} tasks complete"),
        FinishReason::Exhausted => format!(
            "loop budget of {} iterations exhausted with {} of {total} tasks remaining",
            session.max_iterations(),
            session.remaining_tasks()
        ),
        FinishReason::Interrupted => format!(
            "interrupted during task {} of {total} after {} iterations",
            (session.current_index() + 1).min(total),
            session.iteration()
        ),
    }
}
