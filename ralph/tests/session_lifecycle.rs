//! End-to-end session tests through the library.
//!
//! These drive `run_session` with scripted agents (and, on unix, a real
//! `sh` agent) and check the files a session leaves behind.

use std::fs;

use ralph::controller::{LoopEnv, run_session};
use ralph::core::types::{FinishReason, TaskStatus};
use ralph::exit_codes;
use ralph::io::state_files::{NO_ERROR_MARKER, PLAN_PLACEHOLDER};
use ralph::io::transcript::TranscriptStore;
use ralph::test_support::{ScriptedExecutor, TestSession, failure, success};

/// Three tasks, a budget of two, and an agent that always fails.
#[test]
fn failing_agent_exhausts_budget_with_two_transcripts() {
    let fixture = TestSession::new().expect("fixture");
    let mut session = fixture
        .session("1. parse config\n2. add cache\n3. write docs", 2)
        .expect("session");
    let second = format!(
        "error: second attempt\n{}",
        (0..2_000).map(|i| format!("detail line {i}\n")).collect::<String>()
    );
    let executor = ScriptedExecutor::outcomes(vec![
        failure(1, "error: first attempt\n"),
        failure(1, &second),
    ]);

    let reason = run_session(&mut session, &executor, &fixture.env(), |_| {}).expect("run");

    assert_eq!(reason, FinishReason::Exhausted);
    assert_eq!(reason.exit_code(), exit_codes::EXHAUSTED);
    assert_eq!(session.tasks()[0].status, TaskStatus::InProgress);
    assert_eq!(session.tasks()[0].attempts, 2);
    assert_eq!(session.remaining_tasks(), 3);

    let mut transcripts: Vec<String> = fs::read_dir(fixture.transcripts.dir())
        .expect("read attempts")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    transcripts.sort();
    assert_eq!(transcripts, ["0001.md", "0002.md"]);

    let error = fs::read_to_string(&fixture.state.paths().error).expect("read error");
    assert!(error.contains(&second), "ERROR.md must hold the full second output");
    assert!(!error.contains("error: first attempt"));

    let progress = fs::read_to_string(&fixture.state.paths().progress).expect("read progress");
    assert!(progress.contains("- Iteration: 2 / 2"));
    assert!(progress.contains("| 1 | 1 |"));
    assert!(progress.contains("| 2 | 1 |"));
}

#[test]
fn plan_left_by_an_earlier_run_is_not_carried_into_a_new_session() {
    let fixture = TestSession::new().expect("fixture");
    let progress_path = fixture.state.paths().progress.clone();
    fs::create_dir_all(progress_path.parent().expect("parent")).expect("mkdir");
    fs::write(
        &progress_path,
        "<!-- ralph:progress v1 task=1 -->\n# Progress\n\n## Next Plan\n\n\
         OLD PLAN: revert the database migration\n",
    )
    .expect("seed progress");

    let mut session = fixture.session("- write the README", 1).expect("session");
    let executor = ScriptedExecutor::outcomes(vec![failure(1, "error: lint failed")]);
    run_session(&mut session, &executor, &fixture.env(), |_| {}).expect("run");

    let progress = fs::read_to_string(&progress_path).expect("read progress");
    assert!(!progress.contains("OLD PLAN"));
    assert!(progress.contains(PLAN_PLACEHOLDER));
}

#[test]
fn environment_file_is_untouched_across_iterations() {
    let fixture = TestSession::new().expect("fixture");
    let env_path = fixture.state.paths().environment.clone();
    fs::create_dir_all(env_path.parent().expect("parent")).expect("mkdir");
    let original = "# Environment State\n\n- dev server: pid 4242 on port 3000\n";
    fs::write(&env_path, original).expect("seed environment");

    let mut session = fixture.session("- keep trying", 5).expect("session");
    let executor = ScriptedExecutor::repeating(failure(3, "error: still broken"));
    run_session(&mut session, &executor, &fixture.env(), |_| {}).expect("run");

    assert_eq!(executor.requests().len(), 5);
    assert_eq!(fs::read_to_string(&env_path).expect("read"), original);
}

#[test]
fn success_resets_task_state_and_clears_error_file() {
    let fixture = TestSession::new().expect("fixture");
    let mut session = fixture.session("- first\n- second", 10).expect("session");
    let executor = ScriptedExecutor::outcomes(vec![
        failure(1, "error: flaky test"),
        success(),
        success(),
    ]);

    let reason = run_session(&mut session, &executor, &fixture.env(), |_| {}).expect("run");

    assert_eq!(reason, FinishReason::Succeeded);
    assert!(session.attempts().is_empty());
    assert_eq!(session.failures().streak(), 0);
    assert!(session.tasks().iter().all(|task| task.completed_at.is_some()));

    let error = fs::read_to_string(&fixture.state.paths().error).expect("read error");
    assert!(error.contains(NO_ERROR_MARKER));
    let task = fs::read_to_string(&fixture.state.paths().task).expect("read task");
    assert!(task.contains("## All Tasks Complete"));
    assert!(task.contains("- [x] 2. second"));
}

#[test]
fn kept_transcripts_continue_numbering() {
    let fixture = TestSession::new().expect("fixture");
    let mut first = fixture.session("- a", 2).expect("session");
    let executor = ScriptedExecutor::repeating(failure(1, "error: nope"));
    run_session(&mut first, &executor, &fixture.env(), |_| {}).expect("first run");

    let kept = TranscriptStore::open(fixture.transcripts.dir(), true);
    let env = LoopEnv {
        transcripts: &kept,
        ..fixture.env()
    };
    let mut second = fixture.session("- a", 2).expect("session");
    run_session(&mut second, &executor, &env, |_| {}).expect("second run");

    for n in 1..=4 {
        assert!(kept.path_for(n).is_file(), "transcript {n}");
    }
    let audit = fs::read_to_string(fixture.audit.path()).expect("read audit");
    assert_eq!(audit.matches("session started").count(), 2);
}

#[cfg(unix)]
#[test]
fn real_agent_sees_session_files_before_it_runs() {
    use ralph::io::executor::AgentExecutor;
    use ralph::io::tools::{InputMode, ToolSpec};

    let fixture = TestSession::new().expect("fixture");
    let spec = ToolSpec {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "cat > /dev/null; grep -q 'Task 1 of 1' .ralph/TASK.md && \
             [ \"$RALPH_TASK_INDEX\" = 1 ] && [ \"$CI\" = true ] && echo RALPH_DONE"
                .to_string(),
        ],
        input: InputMode::Stdin,
    };
    let executor = AgentExecutor::new("sh-agent", spec).with_echo(false);
    let mut session = fixture.session("- check the files", 3).expect("session");

    let reason = run_session(&mut session, &executor, &fixture.env(), |_| {}).expect("run");

    assert_eq!(reason, FinishReason::Succeeded);
    assert_eq!(session.iteration(), 1);
    let transcript = fs::read_to_string(fixture.transcripts.path_for(1)).expect("read");
    assert!(transcript.contains("- Outcome: success"));
    assert!(transcript.contains("=== stdout ===\nRALPH_DONE\n"));
}
