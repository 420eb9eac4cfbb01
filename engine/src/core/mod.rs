//! Deterministic, pure logic shared by the engine.
//!
//! Core modules are free of I/O side effects. They operate on in-memory text
//! and state and return deterministic outputs suitable for tests.

pub mod escape;
pub mod overlay;
pub mod parser;
pub mod path;
pub mod problem_prompt;
pub mod types;
