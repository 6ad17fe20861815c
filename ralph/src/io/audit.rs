//! Human-readable audit log and the single-writer session finalizer.
//!
//! The audit log is a product artifact, separate from `tracing` output and
//! unaffected by `RUST_LOG`. Both the main loop and the signal path write to
//! it, so every write goes through one mutex.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::core::types::{FinishReason, FinishRecord};
use crate::io::status::StatusWriter;

/// Append-only log of session activity.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry stamped with the current time; failures are logged.
    pub fn record(&self, message: &str) {
        self.record_at(Utc::now(), message);
    }

    pub fn record_at(&self, at: DateTime<Utc>, message: &str) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = self.append(at, message) {
            warn!(path = %self.path.display(), err = %format!("{err:#}"), "failed to write audit log");
        }
    }

    fn append(&self, at: DateTime<Utc>, message: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let stamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut entry = String::new();
        for line in message.lines() {
            entry.push_str(&format!("[{stamp}] {line}\n"));
        }
        if entry.is_empty() {
            entry = format!("[{stamp}]\n");
        }
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

/// Writes the terminal audit entry and status event exactly once.
///
/// The main loop and the signal watchdog race to call [`Finalizer::finalize`];
/// the first caller writes, later callers return `false` after the first has
/// finished writing.
#[derive(Debug)]
pub struct Finalizer {
    audit: Arc<AuditLog>,
    status: Option<Arc<StatusWriter>>,
    recorded: Mutex<Option<FinishReason>>,
}

impl Finalizer {
    pub fn new(audit: Arc<AuditLog>, status: Option<Arc<StatusWriter>>) -> Self {
        Self {
            audit,
            status,
            recorded: Mutex::new(None),
        }
    }

    pub fn finalize(&self, record: &FinishRecord) -> bool {
        let (_, written) = self.settle(record);
        written
    }

    /// Finalize with `record` unless already finalized.
    ///
    /// Returns the reason that stands (the earlier one if another caller won)
    /// and whether this call wrote it.
    pub fn settle(&self, record: &FinishRecord) -> (FinishReason, bool) {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = *recorded {
            return (reason, false);
        }
        self.audit.record_at(
            record.at,
            &format!(
                "session finished: {} (exit {}): {}",
                record.reason.as_str(),
                record.reason.exit_code(),
                record.note
            ),
        );
        if let Some(status) = &self.status {
            status.emit_finish(record);
        }
        *recorded = Some(record.reason);
        (record.reason, true)
    }

    pub fn is_finalized(&self) -> bool {
        self.recorded().is_some()
    }

    pub fn recorded(&self) -> Option<FinishReason> {
        *self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
