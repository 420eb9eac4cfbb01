//! Side-effecting adapters: disk, git, child processes and external services.

pub mod checker;
pub mod config;
pub mod git;
pub mod installer;
pub mod lock;
pub mod model;
pub mod process;
pub mod sql;
pub mod turn_log;
pub mod vfs;
