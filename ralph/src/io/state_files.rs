//! Session directory files: the agent's memory between stateless runs.
//!
//! Every file except `ENVIRONMENT.md` is a projection of [`Session`] and is
//! rewritten atomically before (and after) each attempt. `ENVIRONMENT.md`
//! belongs to the agent once created and is never touched again.
//!
//! All writes are best-effort: a failure is logged and the loop continues
//! with its in-memory state.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use minijinja::context;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::preview;
use crate::core::digest::short_hash;
use crate::core::session::Session;
use crate::core::types::{AttemptRecord, Task};
use crate::io::atomic::write_atomic;
use crate::io::git::{Git, StatusEntry};
use crate::io::render::{self, Renderer};

pub const TASK_FILE: &str = "TASK.md";
pub const PROGRESS_FILE: &str = "PROGRESS.md";
pub const ERROR_FILE: &str = "ERROR.md";
pub const CONTEXT_FILE: &str = "CONTEXT.md";
pub const ENVIRONMENT_FILE: &str = "ENVIRONMENT.md";
pub const ATTEMPTS_DIR: &str = "attempts";

/// Body of `ERROR.md` while the current task has no failures.
pub const NO_ERROR_MARKER: &str = "None: no failures recorded for this task.";

/// Body of the "Next Plan" section until the agent writes one.
pub const PLAN_PLACEHOLDER: &str =
    "_Not written yet. Replace this line with what you will try next and why._";

const HEAD_SHA_LEN: usize = 12;

static PROGRESS_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<!-- ralph:progress v1 task=\d+ key=([0-9a-f]+) -->")
        .expect("progress marker is valid")
});

/// Absolute locations of the session files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub task: PathBuf,
    pub progress: PathBuf,
    pub error: PathBuf,
    pub context: PathBuf,
    pub environment: PathBuf,
    pub attempts: PathBuf,
    refs: FileRefs,
}

/// Session file paths as the agent sees them from the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRefs {
    pub task: String,
    pub progress: String,
    pub error: String,
    pub context: String,
    pub environment: String,
    pub attempts: String,
}

impl SessionPaths {
    /// `session_dir` is resolved against `workdir` unless already absolute.
    pub fn new(workdir: &Path, session_dir: &Path) -> Self {
        let dir = workdir.join(session_dir);
        let shown = |name: &str| session_dir.join(name).display().to_string();
        Self {
            task: dir.join(TASK_FILE),
            progress: dir.join(PROGRESS_FILE),
            error: dir.join(ERROR_FILE),
            context: dir.join(CONTEXT_FILE),
            environment: dir.join(ENVIRONMENT_FILE),
            attempts: dir.join(ATTEMPTS_DIR),
            refs: FileRefs {
                task: shown(TASK_FILE),
                progress: shown(PROGRESS_FILE),
                error: shown(ERROR_FILE),
                context: shown(CONTEXT_FILE),
                environment: shown(ENVIRONMENT_FILE),
                attempts: shown(ATTEMPTS_DIR),
            },
            dir,
        }
    }

    pub fn refs(&self) -> &FileRefs {
        &self.refs
    }
}

/// Git snapshot shown in `CONTEXT.md`. Each field degrades to an
/// `unavailable` note on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub branch: String,
    pub head: String,
    pub status: String,
    pub diff_stat: String,
}

impl ContextSnapshot {
    #[instrument(skip_all)]
    pub fn capture(git: &Git, diff_lines: usize) -> Self {
        Self {
            branch: or_unavailable(git.current_branch()),
            head: or_unavailable(git.head_short_sha(HEAD_SHA_LEN)),
            status: or_unavailable(git.status_porcelain().map(|entries| format_status(&entries))),
            diff_stat: or_unavailable(git.diff_stat(diff_lines).map(|stat| {
                if stat.trim().is_empty() {
                    "No changes against HEAD.".to_string()
                } else {
                    indent_block(&stat)
                }
            })),
        }
    }
}

fn or_unavailable(result: Result<String>) -> String {
    match result {
        Ok(value) => value,
        Err(err) => {
            debug!(err = %format!("{err:#}"), "git context unavailable");
            format!("unavailable ({err:#})")
        }
    }
}

fn format_status(entries: &[StatusEntry]) -> String {
    if entries.is_empty() {
        return "Clean working tree.".to_string();
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| format!("{} {}", entry.code, entry.path))
        .collect();
    indent_block(&lines.join("\n"))
}

/// Four-space indent so markdown shows the text verbatim.
fn indent_block(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Serialize)]
struct TaskView<'a> {
    number: usize,
    description: &'a str,
    status: &'static str,
    attempts: u32,
}

#[derive(Debug, Serialize)]
struct AttemptRow {
    number: u32,
    exit_code: i32,
    duration_ms: u64,
    signature: String,
}

impl AttemptRow {
    fn new(record: &AttemptRecord, preview_chars: usize) -> Self {
        Self {
            number: record.number,
            exit_code: record.exit_code,
            duration_ms: record.duration_ms,
            signature: preview(&record.signature, preview_chars).replace('|', "\\|"),
        }
    }
}

#[derive(Debug, Serialize)]
struct FinishView {
    reason: &'static str,
    note: String,
}

/// Renders and writes the session directory.
#[derive(Debug)]
pub struct StateFiles {
    paths: SessionPaths,
    renderer: Renderer,
    git: Git,
    token: String,
    preview_chars: usize,
    diff_lines: usize,
}

impl StateFiles {
    pub fn new(
        paths: SessionPaths,
        git: Git,
        token: impl Into<String>,
        preview_chars: usize,
        diff_lines: usize,
    ) -> Result<Self> {
        Ok(Self {
            paths,
            renderer: Renderer::new()?,
            git,
            token: token.into(),
            preview_chars,
            diff_lines,
        })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Write every file the agent reads before an attempt.
    #[instrument(skip_all, fields(iteration = session.iteration()))]
    pub fn materialize_all(&self, session: &Session, now: DateTime<Utc>) {
        self.ensure_dirs();
        self.ensure_environment(now);
        self.write_task(session, now);
        self.write_progress(session, now);
        self.write_error(session, now);
        self.write_context(now);
    }

    /// Rewrite the projections of session state after an attempt.
    pub fn refresh(&self, session: &Session, now: DateTime<Utc>) {
        self.write_task(session, now);
        self.write_progress(session, now);
        self.write_error(session, now);
    }

    pub fn ensure_dirs(&self) {
        if let Err(err) = fs::create_dir_all(&self.paths.attempts) {
            warn!(path = %self.paths.attempts.display(), err = %err, "failed to create session directory");
        }
    }

    /// Create `ENVIRONMENT.md` from its template if it does not exist.
    ///
    /// Returns true when this call created the file.
    pub fn ensure_environment(&self, now: DateTime<Utc>) -> bool {
        let result = self
            .render_environment(now)
            .and_then(|body| create_new(&self.paths.environment, &body));
        match result {
            Ok(created) => {
                if created {
                    info!(path = %self.paths.environment.display(), "created environment file");
                }
                created
            }
            Err(err) => {
                warn!(path = %self.paths.environment.display(), err = %format!("{err:#}"), "failed to create environment file");
                false
            }
        }
    }

    pub fn write_task(&self, session: &Session, now: DateTime<Utc>) {
        self.write_best_effort(&self.paths.task, self.render_task(session, now));
    }

    pub fn write_progress(&self, session: &Session, now: DateTime<Utc>) {
        let plan = self.carried_plan(session);
        self.write_best_effort(
            &self.paths.progress,
            self.render_progress(session, plan.as_deref(), now),
        );
    }

    pub fn write_error(&self, session: &Session, now: DateTime<Utc>) {
        self.write_best_effort(&self.paths.error, self.render_error(session, now));
    }

    pub fn write_context(&self, now: DateTime<Utc>) {
        let snapshot = ContextSnapshot::capture(&self.git, self.diff_lines);
        self.write_best_effort(&self.paths.context, self.render_context(&snapshot, now));
    }

    pub fn render_task(&self, session: &Session, now: DateTime<Utc>) -> Result<String> {
        let current = session.current_task().map(task_view);
        let completed: Vec<TaskView<'_>> = session.completed_tasks().map(task_view).collect();
        self.renderer.render(
            render::TASK,
            context! {
                generated => stamp(now),
                current => current,
                total => session.tasks().len(),
                completed => completed,
                files => self.paths.refs(),
                token => self.token.as_str(),
            },
        )
    }

    /// `plan` is the agent's previous "Next Plan" text for this task.
    pub fn render_progress(
        &self,
        session: &Session,
        plan: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let current = session.current_task();
        let rows: Vec<AttemptRow> = session
            .attempts()
            .iter()
            .map(|record| AttemptRow::new(record, self.preview_chars))
            .collect();
        let finish = session.finish_record().map(|record| FinishView {
            reason: record.reason.as_str(),
            note: record.note.clone(),
        });
        let last_signature = session
            .failures()
            .last_signature()
            .map(|sig| preview(sig, self.preview_chars));
        self.renderer.render(
            render::PROGRESS,
            context! {
                generated => stamp(now),
                tool => session.tool(),
                iteration => session.iteration(),
                max_iterations => session.max_iterations(),
                task_number => progress_task_number(session),
                plan_key => plan_key(session),
                total => session.tasks().len(),
                current => current.map(task_view),
                task_attempt => current.map_or(0, |task| task.attempts),
                completed_count => session.completed_tasks().count(),
                streak => session.failures().streak(),
                last_signature => last_signature,
                finish => finish,
                attempts => rows,
                plan => plan.unwrap_or(PLAN_PLACEHOLDER),
            },
        )
    }

    pub fn render_error(&self, session: &Session, now: DateTime<Utc>) -> Result<String> {
        self.renderer.render(
            render::ERROR,
            context! {
                generated => stamp(now),
                task_number => session.current_index() + 1,
                error => session.attempts().last(),
                streak => session.failures().streak(),
                none_marker => NO_ERROR_MARKER,
            },
        )
    }

    pub fn render_context(&self, snapshot: &ContextSnapshot, now: DateTime<Utc>) -> Result<String> {
        self.renderer.render(
            render::CONTEXT,
            context! {
                generated => stamp(now),
                branch => snapshot.branch.as_str(),
                head => snapshot.head.as_str(),
                status => snapshot.status.as_str(),
                diff_stat => snapshot.diff_stat.as_str(),
            },
        )
    }

    pub fn render_environment(&self, now: DateTime<Utc>) -> Result<String> {
        self.renderer
            .render(render::ENVIRONMENT, context! { created => stamp(now) })
    }

    /// The agent's plan from the current `PROGRESS.md`, kept while this
    /// session stays on the same task. Unreadable content, files from other
    /// runs, and plans for other tasks are ignored.
    fn carried_plan(&self, session: &Session) -> Option<String> {
        let existing = fs::read_to_string(&self.paths.progress).ok()?;
        extract_plan(&existing, &plan_key(session))
    }

    fn write_best_effort(&self, path: &Path, rendered: Result<String>) {
        let result = rendered.and_then(|body| write_atomic(path, &body));
        match result {
            Ok(()) => debug!(path = %path.display(), "wrote session file"),
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "failed to write session file");
            }
        }
    }
}

fn task_view(task: &Task) -> TaskView<'_> {
    TaskView {
        number: task.index + 1,
        description: &task.description,
        status: task.status.as_str(),
        attempts: task.attempts,
    }
}

/// 1-based task shown in `PROGRESS.md`; the last task once all are done.
fn progress_task_number(session: &Session) -> usize {
    (session.current_index() + 1).min(session.tasks().len())
}

/// Identity of the plan slot in `PROGRESS.md`: the session start time plus
/// the task shown.
pub fn plan_key(session: &Session) -> String {
    let number = progress_task_number(session);
    let description = session
        .tasks()
        .get(number.saturating_sub(1))
        .map_or("", |task| task.description.as_str());
    let started = session
        .started_at()
        .to_rfc3339_opts(SecondsFormat::Nanos, true);
    short_hash(&format!("{started}\n{number}\n{description}"))
}

fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Pull the "Next Plan" body out of a progress file whose marker carries `key`.
pub fn extract_plan(progress: &str, key: &str) -> Option<String> {
    let first = progress.lines().next()?;
    let marker_key = PROGRESS_MARKER_RE.captures(first)?.get(1)?.as_str();
    if marker_key != key {
        return None;
    }
    let (_, plan) = progress.split_once("\n## Next Plan\n")?;
    let plan = plan.trim();
    if plan.is_empty() || plan == PLAN_PLACEHOLDER {
        return None;
    }
    Some(plan.to_string())
}

/// Write `contents` only if `path` does not exist yet.
fn create_new(path: &Path, contents: &str) -> Result<bool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
    };
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}
