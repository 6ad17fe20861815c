//! Per-attempt transcripts under `<session>/attempts/`.
//!
//! One file per attempt, named by the zero-padded global attempt number and
//! never rewritten. Transcripts hold the exact prompt and the raw, untruncated
//! output streams.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::Value;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::io::render::{self, Renderer};

/// How an attempt ended, as recorded in its transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Interrupted,
}

/// Everything written for one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry<'a> {
    pub timestamp: String,
    pub tool: &'a str,
    pub iteration: u32,
    /// 1-based task position.
    pub task_number: usize,
    pub task_attempt: u32,
    pub task: &'a str,
    pub prompt: &'a str,
    pub prompt_hash: &'a str,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    pub signature: Option<&'a str>,
    pub mutation: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

#[derive(Serialize)]
struct TranscriptView<'a> {
    number: u32,
    #[serde(flatten)]
    entry: &'a TranscriptEntry<'a>,
}

/// Allocates transcript numbers and writes transcript files.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
    offset: u32,
}

impl TranscriptStore {
    /// Prepare the transcript directory.
    ///
    /// Without `keep`, transcripts from earlier runs are removed. With it they
    /// stay, and numbering continues after the highest existing one.
    pub fn open(dir: impl Into<PathBuf>, keep: bool) -> Self {
        let dir = dir.into();
        if !keep && dir.exists() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!(path = %dir.display(), "removed earlier transcripts"),
                Err(err) => warn!(path = %dir.display(), err = %err, "failed to remove earlier transcripts"),
            }
        }
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(path = %dir.display(), err = %err, "failed to create transcript directory");
        }
        let offset = if keep { highest_number(&dir) } else { 0 };
        debug!(path = %dir.display(), offset, "transcript store ready");
        Self { dir, offset }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Transcript number for a global iteration of this run.
    pub fn number_for(&self, iteration: u32) -> u32 {
        self.offset + iteration
    }

    pub fn path_for(&self, number: u32) -> PathBuf {
        self.dir.join(format!("{number:04}.md"))
    }

    /// Write the transcript for `entry`; failures are logged, not returned.
    pub fn write(&self, renderer: &Renderer, entry: &TranscriptEntry<'_>) -> Option<PathBuf> {
        let number = self.number_for(entry.iteration);
        let path = self.path_for(number);
        let result = renderer
            .render(
                render::TRANSCRIPT,
                Value::from_serialize(TranscriptView { number, entry }),
            )
            .and_then(|body| write_once(&path, &body));
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "wrote transcript");
                Some(path)
            }
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "failed to write transcript");
                None
            }
        }
    }
}

fn write_once(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}

fn highest_number(dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_suffix(".md")?.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(iteration: u32, stdout: &'a str) -> TranscriptEntry<'a> {
        TranscriptEntry {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            tool: "claude",
            iteration,
            task_number: 1,
            task_attempt: iteration,
            task: "write the parser",
            prompt: "Read .ralph/TASK.md",
            prompt_hash: "0123456789ab",
            exit_code: 2,
            duration_ms: 1500,
            outcome: AttemptOutcome::Failure,
            signature: Some("exit 2: error: boom"),
            mutation: "Baseline",
            stdout,
            stderr: "error: boom\n",
        }
    }

    #[test]
    fn writes_numbered_transcripts_with_raw_streams() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TranscriptStore::open(temp.path().join("attempts"), false);
        let renderer = Renderer::new().expect("renderer");
        let big = "line\n".repeat(50_000);

        let path = store.write(&renderer, &entry(3, &big)).expect("written");
        assert!(path.ends_with("attempts/0003.md"));
        let body = fs::read_to_string(&path).expect("read");
        assert!(body.starts_with("<!-- ralph:transcript v1 -->\n# Attempt 3\n"));
        assert!(body.contains("- Outcome: failure"));
        assert!(body.contains("- Signature: `exit 2: error: boom`"));
        assert!(body.contains("=== prompt ===\nRead .ralph/TASK.md\n"));
        assert!(body.contains(&big));
        assert!(body.contains("=== stderr ===\nerror: boom\n"));
    }

    #[test]
    fn transcripts_are_never_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TranscriptStore::open(temp.path().join("attempts"), false);
        let renderer = Renderer::new().expect("renderer");

        assert!(store.write(&renderer, &entry(1, "first")).is_some());
        assert!(store.write(&renderer, &entry(1, "second")).is_none());
        let body = fs::read_to_string(store.path_for(1)).expect("read");
        assert!(body.contains("first"));
    }

    #[test]
    fn earlier_runs_are_cleared_unless_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("attempts");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("0007.md"), "old").expect("seed");
        fs::write(dir.join("notes.txt"), "not a transcript").expect("seed");

        let kept = TranscriptStore::open(&dir, true);
        assert_eq!(kept.number_for(1), 8);
        assert!(dir.join("0007.md").is_file());

        let fresh = TranscriptStore::open(&dir, false);
        assert_eq!(fresh.number_for(1), 1);
        assert!(!dir.join("0007.md").exists());
        assert!(dir.is_dir());
    }
}
