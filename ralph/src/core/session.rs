//! The session aggregate: task queue, per-task attempts, failure tracking,
//! and the global iteration budget.
//!
//! `Session` exclusively owns task and attempt data. Renderers and the
//! controller read it through `&Session`; every mutation goes through the
//! methods below so the counters stay consistent.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

use crate::core::classifier::FailureReport;
use crate::core::digest::short_hash;
use crate::core::streak::FailureTracker;
use crate::core::types::{
    AttemptRecord, ExecOutcome, FinishReason, FinishRecord, Task, TaskStatus,
};

/// Streak length at which retries are flagged as stuck.
pub const STUCK_STREAK: u32 = 2;

/// Counters identifying one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStart {
    /// Global iteration (1-based, spans all tasks).
    pub iteration: u32,
    /// Queue index of the task (0-based).
    pub task_index: usize,
    /// Attempt number for this task (1-based).
    pub task_attempt: u32,
}

#[derive(Debug, Clone)]
pub struct Session {
    tasks: Vec<Task>,
    current: usize,
    attempts: Vec<AttemptRecord>,
    failures: FailureTracker,
    iteration: u32,
    max_iterations: u32,
    tool: String,
    started_at: DateTime<Utc>,
    finish: Option<FinishRecord>,
}

impl Session {
    /// Create a session positioned on the first task not already completed.
    pub fn new(
        tasks: Vec<Task>,
        tool: impl Into<String>,
        max_iterations: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let current = first_open_from(&tasks, 0);
        Self {
            tasks,
            current,
            attempts: Vec::new(),
            failures: FailureTracker::new(),
            iteration: 0,
            max_iterations,
            tool: tool.into(),
            started_at: now,
            finish: None,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current)
    }

    pub fn completed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|task| task.is_completed())
    }

    pub fn remaining_tasks(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_completed()).count()
    }

    /// Failed attempts of the in-progress task.
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finish_record(&self) -> Option<&FinishRecord> {
        self.finish.as_ref()
    }

    /// True when every task is completed.
    pub fn is_complete(&self) -> bool {
        self.current >= self.tasks.len()
    }

    pub fn has_budget(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// True while another attempt may start.
    pub fn should_continue(&self) -> bool {
        self.finish.is_none() && !self.is_complete() && self.has_budget()
    }

    /// Terminal state implied by the counters (ignores interruption).
    pub fn natural_finish(&self) -> FinishReason {
        if self.is_complete() {
            FinishReason::Succeeded
        } else {
            FinishReason::Exhausted
        }
    }

    /// Consume one unit of budget and start an attempt on the current task.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<AttemptStart> {
        if self.finish.is_some() {
            bail!("session already finished");
        }
        if !self.has_budget() {
            bail!("loop budget of {} iterations exhausted", self.max_iterations);
        }
        let Some(task) = self.tasks.get_mut(self.current) else {
            bail!("no task left to attempt");
        };

        if task.status == TaskStatus::Pending && task.attempts == 0 {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(now);
        }
        task.attempts += 1;
        self.iteration += 1;

        Ok(AttemptStart {
            iteration: self.iteration,
            task_index: self.current,
            task_attempt: task.attempts,
        })
    }

    /// How the upcoming attempt differs from the previous one.
    pub fn mutation_note(&self) -> String {
        let Some(signature) = self.failures.last_signature() else {
            return "Baseline".to_string();
        };
        let streak = self.failures.streak();
        if streak >= STUCK_STREAK {
            format!(
                "STUCK: the same failure `{signature}` repeated {streak} times in a row. \
                 Change approach instead of repeating the last attempt."
            )
        } else {
            format!(
                "Retry {}: previous attempt failed with `{signature}`. Address that failure.",
                self.attempts.len()
            )
        }
    }

    /// Record a failing attempt and return the updated repeat streak.
    pub fn record_failure(
        &mut self,
        start: &AttemptStart,
        prompt: &str,
        outcome: &ExecOutcome,
        report: FailureReport,
        mutation: String,
        now: DateTime<Utc>,
    ) -> u32 {
        let streak = self.failures.observe(&report.signature, &report.context);
        self.attempts.push(AttemptRecord {
            number: start.task_attempt,
            timestamp: now,
            prompt: prompt.to_string(),
            prompt_hash: short_hash(prompt),
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration_ms,
            signature: report.signature,
            context: report.context,
            mutation,
        });
        streak
    }

    /// Mark the current task complete and advance to the next open task.
    ///
    /// Returns the index of the next task, or `None` when the queue is done.
    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<usize> {
        if let Some(task) = self.tasks.get_mut(self.current) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
        }
        self.attempts.clear();
        self.failures.reset();
        self.current = first_open_from(&self.tasks, self.current + 1);
        (!self.is_complete()).then_some(self.current)
    }

    /// Set the finish metadata. Only the first call has an effect.
    pub fn finish(
        &mut self,
        reason: FinishReason,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.finish.is_some() {
            return false;
        }
        self.finish = Some(FinishRecord {
            reason,
            note: note.into(),
            at: now,
        });
        true
    }
}

fn first_open_from(tasks: &[Task], from: usize) -> usize {
    tasks
        .iter()
        .skip(from)
        .position(|task| !task.is_completed())
        .map_or(tasks.len(), |offset| from + offset)
}
