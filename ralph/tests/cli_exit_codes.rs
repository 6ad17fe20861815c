//! CLI tests for the `ralph` binary.
//!
//! Spawns the binary in a temp dir and verifies exit codes for invalid input,
//! exhausted budgets and completed sessions.

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use ralph::exit_codes;
use ralph::io::status::{StatusEvent, StatusKind};

fn ralph(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ralph"))
        .current_dir(dir)
        .args(args)
        .stdin(Stdio::null())
        .env_remove("RUST_LOG")
        .output()
        .expect("run ralph")
}

#[test]
fn empty_task_text_is_invalid_input() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["   "]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no tasks found"));
}

#[test]
fn missing_input_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &[]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no tasks given"));
}

#[test]
fn unknown_agent_is_invalid_before_any_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["--agent", "nope", "do", "things"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown agent 'nope'"));
    assert!(!temp.path().join(".ralph").exists());
}

#[test]
fn zero_budget_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["-n", "0", "task"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn missing_explicit_config_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["--config", "absent.toml", "task"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[cfg(unix)]
fn write_config(dir: &Path) {
    let config = r#"
pause_ms = 0

[tools.done]
program = "sh"
args = ["-c", "cat > /dev/null; echo RALPH_DONE"]
input = "stdin"

[tools.broken]
program = "sh"
args = ["-c", "cat > /dev/null; echo 'error: nothing works' >&2; exit 1"]
input = "stdin"
"#;
    fs::write(dir.join("ralph.toml"), config).expect("write config");
}

#[cfg(unix)]
#[test]
fn completed_session_exits_ok_and_reports_status() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path());
    fs::write(temp.path().join("tasks.md"), "- [ ] one\n- [ ] two\n").expect("tasks");

    let output = ralph(
        temp.path(),
        &["done", "-f", "tasks.md", "--status-file", "status.json"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let status: StatusEvent = serde_json::from_str(
        &fs::read_to_string(temp.path().join("status.json")).expect("status"),
    )
    .expect("parse status");
    assert_eq!(status.event, StatusKind::Complete);
    assert!(status.done_flag);
    assert_eq!(status.iteration, 2);
    assert!(temp.path().join(".ralph/attempts/0002.md").is_file());
    let audit = fs::read_to_string(temp.path().join("ralph.log")).expect("audit");
    assert!(audit.contains("session finished: succeeded (exit 0)"));
}

#[cfg(unix)]
#[test]
fn failing_agent_exhausts_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path());

    let output = ralph(temp.path(), &["-n", "2", "broken", "fix", "everything"]);

    assert_eq!(output.status.code(), Some(exit_codes::EXHAUSTED));
    let error = fs::read_to_string(temp.path().join(".ralph/ERROR.md")).expect("error file");
    assert!(error.contains("error: nothing works"));
    assert!(temp.path().join(".ralph/ENVIRONMENT.md").is_file());
}

#[cfg(unix)]
#[test]
fn prompt_file_is_the_last_input_fallback() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path());
    fs::write(temp.path().join("PROMPT.md"), "ship the release\n").expect("prompt");

    let output = ralph(temp.path(), &["--agent", "done"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let task = fs::read_to_string(temp.path().join(".ralph/TASK.md")).expect("task file");
    assert!(task.contains("- [x] 1. ship the release"));
}
