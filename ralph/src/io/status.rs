//! Machine-readable status events for script integration (`--status-file`).
//!
//! The file always holds the latest event as a single JSON line.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::{FinishReason, FinishRecord};
use crate::io::atomic::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    IterationStart,
    IterationEnd,
    TaskComplete,
    Complete,
    Exhausted,
    Cancelled,
}

impl From<FinishReason> for StatusKind {
    fn from(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Succeeded => StatusKind::Complete,
            FinishReason::Exhausted => StatusKind::Exhausted,
            FinishReason::Interrupted => StatusKind::Cancelled,
        }
    }
}

/// One status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event: StatusKind,
    /// Global iteration (1-based; 0 before the first attempt).
    pub iteration: u32,
    pub agent: String,
    /// RFC 3339, UTC.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set on terminal events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// True when every task was completed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done_flag: bool,
}

/// Writes status events to a single file, remembering the last iteration seen.
#[derive(Debug)]
pub struct StatusWriter {
    path: PathBuf,
    agent: String,
    last_iteration: AtomicU32,
    lock: Mutex<()>,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>, agent: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            agent: agent.into(),
            last_iteration: AtomicU32::new(0),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Emit a progress event; failures are logged, never returned.
    pub fn emit(&self, event: StatusKind, iteration: u32, message: Option<String>) {
        self.last_iteration.store(iteration, Ordering::SeqCst);
        self.emit_event(StatusEvent {
            event,
            iteration,
            agent: self.agent.clone(),
            timestamp: now_rfc3339(),
            message,
            exit_code: None,
            done_flag: false,
        });
    }

    /// Emit the terminal event for a finished session.
    pub fn emit_finish(&self, record: &FinishRecord) {
        self.emit_event(StatusEvent {
            event: record.reason.into(),
            iteration: self.last_iteration.load(Ordering::SeqCst),
            agent: self.agent.clone(),
            timestamp: record.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            message: Some(record.note.clone()),
            exit_code: Some(record.reason.exit_code()),
            done_flag: record.reason == FinishReason::Succeeded,
        });
    }

    fn emit_event(&self, event: StatusEvent) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = write_status(&self.path, &event) {
            warn!(path = %self.path.display(), err = %format!("{err:#}"), "failed to write status file");
        }
    }
}

/// Write one JSON status event (single line, trailing newline).
pub fn write_status(path: &Path, event: &StatusEvent) -> Result<()> {
    let mut line = serde_json::to_string(event).context("serialize status event")?;
    line.push('\n');
    write_atomic(path, &line)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read_event(path: &Path) -> StatusEvent {
        let data = fs::read_to_string(path).expect("read status file");
        assert!(data.ends_with('\n'));
        serde_json::from_str(&data).expect("parse status event")
    }

    #[test]
    fn iteration_start_has_timestamp_and_no_terminal_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        let writer = StatusWriter::new(&path, "claude");

        writer.emit(StatusKind::IterationStart, 1, None);

        let got = read_event(&path);
        assert_eq!(got.event, StatusKind::IterationStart);
        assert_eq!(got.iteration, 1);
        assert_eq!(got.agent, "claude");
        assert!(!got.timestamp.is_empty());
        assert_eq!(got.exit_code, None);
        assert!(!got.done_flag);

        let raw = fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("exit_code"));
        assert!(!raw.contains("done_flag"));
        assert!(raw.contains("\"event\":\"iteration_start\""));
    }

    #[test]
    fn complete_event_sets_done_flag_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        let writer = StatusWriter::new(&path, "gemini");
        writer.emit(StatusKind::IterationEnd, 3, None);

        writer.emit_finish(&FinishRecord {
            reason: FinishReason::Succeeded,
            note: "all tasks complete".to_string(),
            at: Utc::now(),
        });

        let got = read_event(&path);
        assert_eq!(got.event, StatusKind::Complete);
        assert_eq!(got.iteration, 3);
        assert!(got.done_flag);
        assert_eq!(got.exit_code, Some(crate::exit_codes::OK));
    }

    #[test]
    fn cancelled_event_uses_interrupted_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        let writer = StatusWriter::new(&path, "copilot");

        writer.emit_finish(&FinishRecord {
            reason: FinishReason::Interrupted,
            note: "signal".to_string(),
            at: Utc::now(),
        });

        let got = read_event(&path);
        assert_eq!(got.event, StatusKind::Cancelled);
        assert_eq!(got.exit_code, Some(crate::exit_codes::INTERRUPTED));
        assert!(!got.done_flag);
        assert_eq!(got.message.as_deref(), Some("signal"));
    }

    #[test]
    fn unwritable_path_is_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").expect("write blocker");
        let writer = StatusWriter::new(blocker.join("status.json"), "claude");
        writer.emit(StatusKind::IterationStart, 1, None);
    }
}
