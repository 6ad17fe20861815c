//! Stable exit codes for the `ralph` binary.

/// Every task was verified complete.
pub const OK: i32 = 0;
/// The loop budget ran out with tasks still incomplete.
pub const EXHAUSTED: i32 = 1;
/// The session was stopped by SIGINT/SIGTERM.
pub const INTERRUPTED: i32 = 2;
/// Invalid configuration or task input; no task was processed.
pub const INVALID: i32 = 3;
