//! Side-effecting collaborators of the session controller: files, processes,
//! git, signals and logs.

pub mod atomic;
pub mod audit;
pub mod config;
pub mod executor;
pub mod git;
pub mod interrupt;
pub mod process;
pub mod prompt;
pub mod render;
pub mod state_files;
pub mod status;
pub mod tools;
pub mod transcript;
