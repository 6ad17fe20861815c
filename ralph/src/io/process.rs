//! Helpers for running child processes with live output and full capture.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::interrupt::CancelToken;

/// How often a running child is checked for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output readers may keep draining after the child has exited.
///
/// A background process started by the child inherits its pipes and can hold
/// them open indefinitely; output arriving after this window is dropped.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

type Captured = Arc<Mutex<Vec<u8>>>;
type ReaderDone = (&'static str, Result<()>);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    /// True if the child was killed because the token was cancelled.
    pub cancelled: bool,
}

impl CommandOutput {
    /// Exit code, or `-1` when the child was terminated by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

#[derive(Clone, Copy)]
enum Echo {
    Stdout,
    Stderr,
    Off,
}

/// Run a command to completion, capturing stdout and stderr separately.
///
/// Output is read concurrently while the child runs and, when `echo` is set,
/// mirrored to this process's stdout/stderr as it arrives. Nothing the child
/// writes before exiting is truncated. There is no timeout: the child runs
/// until it exits or `cancel` fires, in which case it is killed. Readers then
/// get [`DRAIN_GRACE`] to reach end of stream.
#[instrument(skip_all, fields(echo = echo, stdin_bytes = stdin.map_or(0, <[u8]>::len)))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    echo: bool,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (stdout_echo, stderr_echo) = if echo {
        (Echo::Stdout, Echo::Stderr)
    } else {
        (Echo::Off, Echo::Off)
    };
    let (done_tx, done_rx) = mpsc::channel();
    let stdout_buf = Captured::default();
    let stderr_buf = Captured::default();
    spawn_reader("stdout", stdout, stdout_echo, &stdout_buf, done_tx.clone());
    spawn_reader("stderr", stderr, stderr_echo, &stderr_buf, done_tx);

    // Feed stdin from a detached thread so neither a child that never reads
    // nor a background process holding the pipe can block this function.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input)
                && e.kind() != io::ErrorKind::BrokenPipe
            {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            cancelled = true;
            if let Err(e) = child.kill() {
                warn!(err = %e, "failed to kill child");
            }
            break child.wait().context("wait command after kill")?;
        }
    };
    let duration = started.elapsed();

    drain_readers(&done_rx, 2, DRAIN_GRACE)?;
    let stdout = take_captured(&stdout_buf);
    let stderr = take_captured(&stderr_buf);

    debug!(
        exit_code = ?status.code(),
        cancelled,
        duration_ms = duration.as_millis() as u64,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        duration,
        cancelled,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: &'static str,
    reader: R,
    echo: Echo,
    buf: &Captured,
    done: Sender<ReaderDone>,
) {
    let buf = Arc::clone(buf);
    thread::spawn(move || {
        let result = read_stream_with_tee(reader, echo, &buf);
        // The receiver is gone once the drain window has passed.
        let _ = done.send((stream, result));
    });
}

/// Wait up to `grace` for `pending` readers to hit end of stream.
///
/// Readers still blocked after `grace` are left running detached; whatever
/// they captured so far is kept.
fn drain_readers(done: &Receiver<ReaderDone>, mut pending: usize, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    while pending > 0 {
        match done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((stream, result)) => {
                result.with_context(|| format!("read {stream}"))?;
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    pending,
                    grace_ms = grace.as_millis() as u64,
                    "output still open after the child exited, keeping what was captured"
                );
                return Ok(());
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok(())
}

fn take_captured(buf: &Captured) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Read a stream to the end into `buf`, mirroring each chunk to the terminal.
fn read_stream_with_tee<R: Read>(mut reader: R, echo: Echo, buf: &Mutex<Vec<u8>>) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        buf.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk[..n]);

        let written = match echo {
            Echo::Stdout => write_flush(&mut io::stdout().lock(), &chunk[..n]),
            Echo::Stderr => write_flush(&mut io::stderr().lock(), &chunk[..n]),
            Echo::Off => Ok(()),
        };
        if let Err(e) = written {
            warn!(err = %e, "failed to echo child output");
        }
    }

    Ok(())
}

fn write_flush<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)?;
    writer.flush()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_streams_separately_with_exit_code() {
        let output = run_command_streaming(
            sh("echo out-line; echo err-line >&2; exit 3"),
            None,
            false,
            &CancelToken::new(),
        )
        .expect("run");

        assert_eq!(output.exit_code(), 3);
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out-line\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err-line\n");
        assert!(!output.cancelled);
    }

    #[test]
    fn feeds_stdin_to_the_child() {
        let output = run_command_streaming(
            sh("cat"),
            Some(b"prompt via stdin"),
            false,
            &CancelToken::new(),
        )
        .expect("run");

        assert_eq!(output.exit_code(), 0);
        assert_eq!(String::from_utf8_lossy(&output.stdout), "prompt via stdin");
    }

    #[test]
    fn large_output_is_not_truncated() {
        let output = run_command_streaming(
            sh("i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"),
            None,
            false,
            &CancelToken::new(),
        )
        .expect("run");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert_eq!(stdout.lines().count(), 20_000);
        assert!(stdout.ends_with("line-19999\n"));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });

        let output =
            run_command_streaming(sh("exec sleep 30"), None, false, &cancel).expect("run");
        trigger.join().expect("join");

        assert!(output.cancelled);
        assert!(output.duration < Duration::from_secs(20));
        assert_ne!(output.exit_code(), 0);
    }

    #[test]
    fn background_process_holding_the_pipes_does_not_block() {
        let started = Instant::now();
        let output = run_command_streaming(
            sh("sleep 30 & echo started; exit 1"),
            None,
            false,
            &CancelToken::new(),
        )
        .expect("run");

        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(output.exit_code(), 1);
        assert_eq!(String::from_utf8_lossy(&output.stdout), "started\n");
        assert!(!output.cancelled);
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let err = run_command_streaming(
            Command::new("ralph-test-no-such-binary"),
            None,
            false,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
