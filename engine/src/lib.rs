//! Response-processing engine for an AI app builder.
//!
//! A model response carries `<dyad-*>` tags that describe project changes. This
//! crate turns such a response into a committed change set:
//!
//! - **[`core`]**: Pure logic (tag parsing, escaping, path normalization, the
//!   overlay model, the fix prompt). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git, the problem checker, package
//!   installs, SQL, config, turn records, the model boundary).
//!
//! Orchestration modules ([`stream`], [`repair`], [`apply`], [`turn`]) combine
//! the two. [`session`] carries per-turn state and cancellation.

pub mod apply;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod repair;
pub mod session;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod turn;
