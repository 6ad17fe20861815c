//! Parse free-form task input into an ordered queue.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

use crate::core::types::{Task, TaskStatus};

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s+\[([ xX])\]\s*(.*)$").expect("checkbox pattern is valid")
});
static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s+(.*)$").expect("numbered pattern is valid"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s+(.*)$").expect("bullet pattern is valid"));

/// Parse raw multi-line text into tasks.
///
/// Each non-blank line becomes exactly one task. Precedence per trimmed line:
/// checkbox item, numbered item, bullet item, bare line. Checked boxes (`x`/`X`)
/// start as `Completed`; everything else is `Pending`.
///
/// Errors when the input holds no non-blank line.
pub fn parse_tasks(raw: &str) -> Result<Vec<Task>> {
    let tasks: Vec<Task> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            let (description, status) = parse_line(line);
            Task::new(index, description, status)
        })
        .collect();

    if tasks.is_empty() {
        bail!("no tasks found in input");
    }
    Ok(tasks)
}

fn parse_line(line: &str) -> (&str, TaskStatus) {
    if let Some(caps) = CHECKBOX_RE.captures(line) {
        let status = match &caps[1] {
            "x" | "X" => TaskStatus::Completed,
            _ => TaskStatus::Pending,
        };
        let text = caps.get(2).map_or("", |m| m.as_str().trim());
        return (non_empty_or(text, line), status);
    }
    if let Some(caps) = NUMBERED_RE.captures(line) {
        let text = caps.get(1).map_or("", |m| m.as_str().trim());
        return (non_empty_or(text, line), TaskStatus::Pending);
    }
    if let Some(caps) = BULLET_RE.captures(line) {
        let text = caps.get(1).map_or("", |m| m.as_str().trim());
        return (non_empty_or(text, line), TaskStatus::Pending);
    }
    (line, TaskStatus::Pending)
}

/// A marker with no text keeps the whole line so the task count stays stable.
fn non_empty_or<'a>(text: &'a str, line: &'a str) -> &'a str {
    if text.is_empty() { line } else { text }
}
