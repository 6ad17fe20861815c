//! Task-queue agent loop controller.
//!
//! This crate drives an external, non-interactive coding agent against a queue
//! of tasks until each task is verified complete or a loop budget runs out.
//! Between stateless agent runs, durable markdown files in the session
//! directory act as the agent's memory. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task parsing, failure
//!   classification, streak tracking, the session aggregate). No I/O; callers
//!   pass timestamps in.
//! - **[`io`]**: Side-effecting operations (session files, process execution,
//!   git, signals, logs). Isolated behind small types and the
//!   [`io::executor::Executor`] trait so tests can script the agent.
//!
//! [`controller`] couples the two into the session loop used by the binary.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
