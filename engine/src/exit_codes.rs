//! Stable exit codes for `dyad-engine` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Bad input or config, or the apply pass reported an error.
pub const INVALID: i32 = 1;
/// `dyad-engine check` found problems.
pub const PROBLEMS: i32 = 2;
