//! Deterministic, pure logic shared by the session controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take timestamps from callers, and return deterministic
//! outputs suitable for tests.

pub mod classifier;
pub mod digest;
pub mod session;
pub mod streak;
pub mod task_queue;
pub mod types;
