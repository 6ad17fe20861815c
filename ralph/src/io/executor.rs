//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the session controller from the actual
//! agent backend. [`AgentExecutor`] spawns the tool described by a
//! [`ToolSpec`]; tests use scripted executors that return predetermined
//! outcomes without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::session::AttemptStart;
use crate::core::types::ExecOutcome;
use crate::io::interrupt::CancelToken;
use crate::io::process::run_command_streaming;
use crate::io::tools::{ToolRegistry, ToolSpec};

pub const ENV_ITERATION: &str = "RALPH_ITERATION";
pub const ENV_TASK_INDEX: &str = "RALPH_TASK_INDEX";
pub const ENV_TASK_ATTEMPT: &str = "RALPH_TASK_ATTEMPT";
pub const ENV_NON_INTERACTIVE: &str = "RALPH_NON_INTERACTIVE";

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text to feed to the agent.
    pub prompt: String,
    /// Extra environment variables for the agent process.
    pub env: Vec<(String, String)>,
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run one attempt. `Err` means the agent could not be run at all.
    fn exec(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutcome>;
}

/// Environment identifying an attempt, plus non-interactive flags.
///
/// `RALPH_TASK_INDEX` is 1-based to match what humans see in the task file.
pub fn attempt_env(start: &AttemptStart) -> Vec<(String, String)> {
    vec![
        (ENV_ITERATION.to_string(), start.iteration.to_string()),
        (ENV_TASK_INDEX.to_string(), (start.task_index + 1).to_string()),
        (ENV_TASK_ATTEMPT.to_string(), start.task_attempt.to_string()),
        (ENV_NON_INTERACTIVE.to_string(), "1".to_string()),
        ("CI".to_string(), "true".to_string()),
    ]
}

/// Executor that spawns an external agent tool.
#[derive(Debug, Clone)]
pub struct AgentExecutor {
    name: String,
    spec: ToolSpec,
    echo: bool,
}

impl AgentExecutor {
    pub fn new(name: impl Into<String>, spec: ToolSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            echo: true,
        }
    }

    /// Resolve `name` in the registry; unknown names are a configuration error.
    pub fn from_registry(registry: &ToolRegistry, name: &str) -> Result<Self> {
        let spec = registry.get(name)?.clone();
        Ok(Self::new(name, spec))
    }

    /// Mirror agent output to the terminal (on by default).
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for AgentExecutor {
    #[instrument(skip_all, fields(tool = %self.name, input = ?self.spec.input))]
    fn exec(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutcome> {
        info!(workdir = %request.workdir.display(), program = %self.spec.program, "starting agent");

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(self.spec.render_args(&request.prompt))
            .current_dir(&request.workdir);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let output = run_command_streaming(
            cmd,
            self.spec.stdin_payload(&request.prompt),
            self.echo,
            cancel,
        )
        .with_context(|| format!("run agent '{}' ({})", self.name, self.spec.program))?;

        let outcome = ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.exit_code(),
            duration_ms: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
            interrupted: output.cancelled,
        };
        if outcome.exit_code != 0 {
            warn!(exit_code = outcome.exit_code, "agent exited non-zero");
        }
        debug!(duration_ms = outcome.duration_ms, "agent finished");
        Ok(outcome)
    }
}
