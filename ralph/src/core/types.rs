//! Shared deterministic types for the session core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O; timestamps are always supplied by callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

/// One unit of work handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable position in the queue (0-based).
    pub index: usize,
    /// Free-form description; opaque to the rest of the system.
    pub description: String,
    pub status: TaskStatus,
    /// Set when the first attempt starts.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task is verified complete.
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic attempt counter, never reset.
    pub attempts: u32,
}

impl Task {
    pub fn new(index: usize, description: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            index,
            description: description.into(),
            status,
            started_at: None,
            completed_at: None,
            attempts: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// A failing attempt kept in memory until its task succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 1-based, per task.
    pub number: u32,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    /// Short content hash of `prompt`, used to correlate transcripts.
    pub prompt_hash: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub signature: String,
    /// Unabridged diagnostic context.
    pub context: String,
    /// How this attempt differs from the previous one.
    pub mutation: String,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Every task was verified complete.
    Succeeded,
    /// The loop budget ran out with tasks remaining.
    Exhausted,
    /// An external interrupt stopped the session.
    Interrupted,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Succeeded => "succeeded",
            FinishReason::Exhausted => "exhausted",
            FinishReason::Interrupted => "interrupted",
        }
    }

    /// Process exit code for this terminal state.
    pub fn exit_code(self) -> i32 {
        match self {
            FinishReason::Succeeded => crate::exit_codes::OK,
            FinishReason::Exhausted => crate::exit_codes::EXHAUSTED,
            FinishReason::Interrupted => crate::exit_codes::INTERRUPTED,
        }
    }
}

/// Terminal metadata, set exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishRecord {
    pub reason: FinishReason,
    pub note: String,
    pub at: DateTime<Utc>,
}

/// Raw result of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process did not report an exit code.
    pub exit_code: i32,
    pub duration_ms: u64,
    /// True when the process was killed because the session was cancelled.
    pub interrupted: bool,
}
