//! Test-only helpers: a scripted executor and a temp-dir session fixture.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::controller::LoopEnv;
use crate::core::session::Session;
use crate::core::task_queue::parse_tasks;
use crate::core::types::ExecOutcome;
use crate::io::audit::{AuditLog, Finalizer};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::git::Git;
use crate::io::interrupt::CancelToken;
use crate::io::state_files::{SessionPaths, StateFiles};
use crate::io::status::StatusWriter;
use crate::io::transcript::TranscriptStore;

pub const TOKEN: &str = "RALPH_DONE";

/// Fixed timestamp `secs` after an arbitrary epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .unwrap_or_default()
}

/// Exit 0 with the completion token in stdout.
pub fn success() -> ExecOutcome {
    ExecOutcome {
        stdout: format!("all checks pass\n{TOKEN}\n"),
        exit_code: 0,
        duration_ms: 10,
        ..ExecOutcome::default()
    }
}

/// Non-zero exit with the given stderr.
pub fn failure(exit_code: i32, stderr: &str) -> ExecOutcome {
    ExecOutcome {
        stdout: "working...\n".to_string(),
        stderr: stderr.to_string(),
        exit_code,
        duration_ms: 10,
        ..ExecOutcome::default()
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Outcome(ExecOutcome),
    /// The agent could not be started.
    SpawnError(String),
    /// Cancel the session while the agent runs.
    Interrupt,
}

/// Executor returning queued responses and recording every request.
///
/// Once the queue is empty the `fallback` outcome repeats, if set.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<ScriptedStep>>,
    fallback: Option<ExecOutcome>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    pub fn outcomes(outcomes: Vec<ExecOutcome>) -> Self {
        Self::new(outcomes.into_iter().map(ScriptedStep::Outcome).collect())
    }

    pub fn repeating(outcome: ExecOutcome) -> Self {
        Self {
            fallback: Some(outcome),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutcome> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match step {
            Some(ScriptedStep::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedStep::SpawnError(message)) => Err(anyhow!(message)),
            Some(ScriptedStep::Interrupt) => {
                cancel.cancel();
                Ok(ExecOutcome {
                    stdout: "partial output\n".to_string(),
                    exit_code: -1,
                    duration_ms: 5,
                    interrupted: true,
                    ..ExecOutcome::default()
                })
            }
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("scripted executor has no more steps")),
        }
    }
}

/// Session collaborators rooted in a temporary working directory.
pub struct TestSession {
    pub temp: TempDir,
    pub state: StateFiles,
    pub transcripts: TranscriptStore,
    pub audit: Arc<AuditLog>,
    pub status: Arc<StatusWriter>,
    pub finalizer: Finalizer,
    pub cancel: CancelToken,
}

impl TestSession {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let paths = SessionPaths::new(&root, Path::new(".ralph"));
        let transcripts = TranscriptStore::open(&paths.attempts, false);
        let state = StateFiles::new(paths, Git::new(&root), TOKEN, 160, 40)?;
        let audit = Arc::new(AuditLog::new(root.join("ralph.log")));
        let status = Arc::new(StatusWriter::new(root.join("status.json"), "scripted"));
        let finalizer = Finalizer::new(Arc::clone(&audit), Some(Arc::clone(&status)));
        Ok(Self {
            temp,
            state,
            transcripts,
            audit,
            status,
            finalizer,
            cancel: CancelToken::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Session over `raw` task input, using the `scripted` tool.
    pub fn session(&self, raw: &str, max_iterations: u32) -> Result<Session> {
        Ok(Session::new(parse_tasks(raw)?, "scripted", max_iterations, Utc::now()))
    }

    /// Loop environment with no pause between attempts.
    pub fn env(&self) -> LoopEnv<'_> {
        LoopEnv {
            workdir: self.root().to_path_buf(),
            pause: Duration::ZERO,
            preview_chars: 160,
            state: &self.state,
            transcripts: &self.transcripts,
            audit: &self.audit,
            status: Some(self.status.as_ref()),
            finalizer: &self.finalizer,
            cancel: &self.cancel,
        }
    }
}
