//! Durable per-turn records under the configured history directory.
//!
//! Layout: `<history_dir>/<chat_id>/<message_id>.json`. Records are product
//! output and are written regardless of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{CommitRecord, Operation, ProblemReport};
use crate::io::config::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub chat_id: i64,
    pub message_id: i64,
    /// Full response text as received, including any continuation rounds.
    pub response: String,
    pub cancelled: bool,
    pub operations: Vec<Operation>,
    pub commit: Option<CommitRecord>,
    /// Problems still present after the repair loop, if it ran.
    pub problems: Option<ProblemReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

pub fn record_path(history_dir: &Path, chat_id: i64, message_id: i64) -> PathBuf {
    history_dir
        .join(chat_id.to_string())
        .join(format!("{message_id}.json"))
}

pub fn write_turn_record(history_dir: &Path, record: &TurnRecord) -> Result<PathBuf> {
    let path = record_path(history_dir, record.chat_id, record.message_id);
    let mut buf = serde_json::to_string_pretty(record).context("serialize turn record")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    Ok(path)
}

pub fn load_turn_record(path: &Path) -> Result<TurnRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
