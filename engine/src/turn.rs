//! Orchestration for one conversation turn.
//!
//! Stream the response, run the repair loop against an overlay, apply the final
//! operation list, then write the turn record. Cancellation at any point before
//! apply leaves the project untouched.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::apply::{ApplyOutcome, Collaborators, apply_operations};
use crate::core::parser::{StreamParser, chat_summary};
use crate::core::types::Operation;
use crate::io::checker::ProblemChecker;
use crate::io::config::EngineConfig;
use crate::io::installer::PackageInstaller;
use crate::io::model::{ModelClient, ModelRequest};
use crate::io::sql::SqlExecutor;
use crate::io::turn_log::{TurnRecord, write_turn_record};
use crate::repair::{RepairConfig, RepairOutcome, RepairStop, run_repair};
use crate::session::TurnSession;
use crate::stream::consume_stream;

/// Appended to the stored text of a cancelled response.
pub const CANCELLED_NOTE: &str = "[Response cancelled by user]";

/// External collaborators a turn needs.
#[derive(Clone, Copy)]
pub struct Engine<'a> {
    pub config: &'a EngineConfig,
    pub model: &'a dyn ModelClient,
    pub checker: &'a dyn ProblemChecker,
    pub installer: &'a dyn PackageInstaller,
    pub sql: Option<&'a dyn SqlExecutor>,
}

/// Result of a single turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Response text including any fix rounds.
    pub response: String,
    pub cancelled: bool,
    /// The final operation list handed to the apply engine.
    pub operations: Vec<Operation>,
    pub repair: Option<RepairOutcome>,
    pub apply: Option<ApplyOutcome>,
    pub record_path: Option<PathBuf>,
}

/// Run one turn against the project at `root`.
///
/// The caller owns the session's lifecycle (see [`crate::session::ActiveTurns`]).
#[instrument(skip_all, fields(root = %root.display(), chat_id = session.chat_id, message_id = session.message_id))]
pub fn run_turn<F: FnMut(&StreamParser)>(
    engine: &Engine<'_>,
    root: &Path,
    session: &TurnSession,
    request: &ModelRequest,
    on_chunk: F,
) -> Result<TurnOutcome> {
    let streamed = consume_stream(
        engine.model,
        request,
        session,
        engine.config.max_continuations,
        on_chunk,
    )?;
    let summary = chat_summary(&streamed.text);
    let mut outcome = TurnOutcome {
        response: streamed.text.clone(),
        cancelled: streamed.cancelled,
        operations: streamed.parsed.completed_operations(),
        repair: None,
        apply: None,
        record_path: None,
    };

    if !outcome.cancelled && engine.config.auto_fix_problems {
        let repair = run_repair(
            root,
            session,
            engine.model,
            engine.checker,
            request,
            &streamed.text,
            std::mem::take(&mut outcome.operations),
            RepairConfig::from(engine.config),
        )?;
        for text in &repair.responses {
            outcome.response.push_str("\n\n");
            outcome.response.push_str(text);
        }
        outcome.operations = repair.operations.clone();
        outcome.cancelled = repair.stop == RepairStop::Cancelled;
        outcome.repair = Some(repair);
    }

    if outcome.cancelled {
        info!("turn cancelled, nothing applied");
    } else {
        outcome.apply = Some(apply_operations(
            root,
            session,
            &outcome.operations,
            summary.as_deref(),
            engine.config,
            Collaborators {
                installer: engine.installer,
                sql: engine.sql,
            },
        ));
    }

    if let Some(history_dir) = &engine.config.history_dir {
        match write_turn_record(history_dir, &turn_record(session, &outcome)) {
            Ok(path) => outcome.record_path = Some(path),
            Err(err) => warn!(err = %err, "failed to write turn record"),
        }
    }
    Ok(outcome)
}

fn turn_record(session: &TurnSession, outcome: &TurnOutcome) -> TurnRecord {
    let mut response = outcome.response.clone();
    if outcome.cancelled {
        response.push_str("\n\n");
        response.push_str(CANCELLED_NOTE);
    }
    let apply = outcome.apply.as_ref();
    let mut errors: Vec<String> = apply.map(|a| a.errors.clone()).unwrap_or_default();
    if let Some(err) = apply.and_then(|a| a.error.clone()) {
        errors.push(err);
    }
    let mut warnings: Vec<String> = apply.map(|a| a.warnings.clone()).unwrap_or_default();
    if let Some(err) = apply.and_then(|a| a.extra_files_error.clone()) {
        warnings.push(format!("Failed to commit extra files: {err}"));
    }
    if let Some(RepairStop::CheckFailed(err)) = outcome.repair.as_ref().map(|r| &r.stop) {
        warnings.push(format!("Problem check failed: {err}"));
    }
    TurnRecord {
        chat_id: session.chat_id,
        message_id: session.message_id,
        response,
        cancelled: outcome.cancelled,
        operations: outcome.operations.clone(),
        commit: apply.and_then(|a| a.commit.clone()),
        problems: outcome.repair.as_ref().and_then(|r| r.report.clone()),
        warnings,
        errors,
    }
}
