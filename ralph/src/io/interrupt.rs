//! Cancellation plumbing for SIGINT/SIGTERM.
//!
//! The first signal cancels the [`CancelToken`]: the running agent is killed,
//! pauses return early, and the main loop finishes through its normal exit
//! path. A watchdog forces the shutdown callback if the loop has not exited
//! within the grace period; a second signal forces it immediately.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Time the main loop gets to exit on its own after the first signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Cloneable, thread-safe cancellation flag with an interruptible sleep.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `duration`. Returns `true` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Callback that records the interrupted state and terminates the process.
pub type ForceShutdown = Arc<dyn Fn() + Send + Sync>;

/// Reaction to each received signal.
///
/// The first signal cancels `token` and arms a watchdog that calls `force`
/// after `grace`. Any later signal calls `force` at once.
pub struct SignalHandler {
    token: CancelToken,
    force: ForceShutdown,
    grace: Duration,
    signals: AtomicU32,
}

impl SignalHandler {
    pub fn new(token: CancelToken, force: ForceShutdown, grace: Duration) -> Self {
        Self {
            token,
            force,
            grace,
            signals: AtomicU32::new(0),
        }
    }

    pub fn on_signal(&self) {
        if self.signals.fetch_add(1, Ordering::SeqCst) == 0 {
            warn!("interrupt received, stopping the session");
            self.token.cancel();
            let force = Arc::clone(&self.force);
            let grace = self.grace;
            thread::spawn(move || {
                thread::sleep(grace);
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "session did not stop in time, forcing exit"
                );
                force();
            });
        } else {
            warn!("second interrupt received, forcing exit");
            (self.force)();
        }
    }
}

/// Install the process-wide signal handler.
pub fn install_handler(token: CancelToken, force: ForceShutdown, grace: Duration) -> Result<()> {
    let handler = SignalHandler::new(token, force, grace);
    ctrlc::set_handler(move || handler.on_signal()).context("install signal handler")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn sleep_runs_full_duration_without_cancel() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_sleepers_in_other_threads() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(token.is_cancelled());
        handle.join().expect("join");
    }

    #[test]
    fn cancelled_token_sleeps_zero_time() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.sleep(Duration::from_secs(30)));
    }

    fn counting_force() -> (ForceShutdown, mpsc::Receiver<Instant>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let force: ForceShutdown = Arc::new(move || {
            let _ = tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(Instant::now());
        });
        (force, rx)
    }

    #[test]
    fn first_signal_cancels_then_forces_after_grace() {
        let token = CancelToken::new();
        let (force, forced) = counting_force();
        let handler = SignalHandler::new(token.clone(), force, Duration::from_millis(100));

        let signalled = Instant::now();
        handler.on_signal();
        assert!(token.is_cancelled());
        assert!(forced.try_recv().is_err());

        let at = forced.recv_timeout(Duration::from_secs(10)).expect("watchdog fired");
        assert!(at.duration_since(signalled) >= Duration::from_millis(100));
        assert!(forced.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn second_signal_forces_immediately() {
        let token = CancelToken::new();
        let (force, forced) = counting_force();
        let handler = SignalHandler::new(token.clone(), force, Duration::from_secs(60));

        handler.on_signal();
        assert!(forced.try_recv().is_err());
        handler.on_signal();
        forced
            .recv_timeout(Duration::from_secs(1))
            .expect("forced by second signal");
        assert!(token.is_cancelled());
    }
}
