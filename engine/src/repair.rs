//! Bounded auto-repair loop.
//!
//! Check the project as it would look after the pending operations; on
//! problems, ask the model to fix them, merge the operations from its reply and
//! check again. Nothing here touches the real project.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::problem_prompt::render_fix_prompt;
use crate::core::types::{Operation, ProblemReport};
use crate::io::checker::ProblemChecker;
use crate::io::config::EngineConfig;
use crate::io::model::{ChatMessage, ModelClient, ModelRequest};
use crate::session::TurnSession;
use crate::stream::consume_stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairConfig {
    pub max_rounds: u32,
    pub max_continuations: u32,
}

impl From<&EngineConfig> for RepairConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_rounds: config.max_repair_rounds,
            max_continuations: config.max_continuations,
        }
    }
}

/// Why the loop did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The chat mode does not allow file changes.
    ReadOnlyMode,
    /// Packages are about to be installed; checking now would report their
    /// imports as missing.
    PendingDependencyInstall,
}

/// Reason why `run_repair` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairStop {
    Skipped(SkipReason),
    Clean,
    /// Rounds exhausted with problems remaining. Not an error.
    GaveUp,
    Cancelled,
    /// The checker itself failed; the loop stops without a verdict.
    CheckFailed(String),
}

/// Summary of a repair loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Original operations followed by those from every completed fix round.
    pub operations: Vec<Operation>,
    /// Follow-up model turns requested.
    pub rounds: u32,
    /// Response text of each completed fix round, in order.
    pub responses: Vec<String>,
    /// Result of the last check that ran.
    pub report: Option<ProblemReport>,
    pub stop: RepairStop,
}

/// Run the repair loop for a finished response.
///
/// `request` is the conversation that produced `response`; fix rounds extend it.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(chat_id = session.chat_id, max_rounds = config.max_rounds))]
pub fn run_repair<M, C>(
    root: &Path,
    session: &TurnSession,
    client: &M,
    checker: &C,
    request: &ModelRequest,
    response: &str,
    operations: Vec<Operation>,
    config: RepairConfig,
) -> Result<RepairOutcome>
where
    M: ModelClient + ?Sized,
    C: ProblemChecker + ?Sized,
{
    let mut outcome = RepairOutcome {
        operations,
        rounds: 0,
        responses: Vec::new(),
        report: None,
        stop: RepairStop::Clean,
    };

    if !session.mode.allows_file_changes() {
        outcome.stop = RepairStop::Skipped(SkipReason::ReadOnlyMode);
        return Ok(outcome);
    }
    if outcome
        .operations
        .iter()
        .any(|op| matches!(op, Operation::AddDependency { .. }))
    {
        info!("dependency install pending, skipping problem check");
        outcome.stop = RepairStop::Skipped(SkipReason::PendingDependencyInstall);
        return Ok(outcome);
    }

    let mut transcript = request.followed_by([ChatMessage::assistant(response)]);
    loop {
        if session.is_cancelled() {
            outcome.stop = RepairStop::Cancelled;
            return Ok(outcome);
        }

        let report = match checker.check(root, &outcome.operations) {
            Ok(report) => report,
            Err(err) => {
                warn!(err = %err, "problem check failed");
                outcome.stop = RepairStop::CheckFailed(err.to_string());
                return Ok(outcome);
            }
        };
        let clean = report.is_clean();
        let problem_count = report.problems.len();
        let prompt = (!clean).then(|| render_fix_prompt(&report)).transpose()?;
        outcome.report = Some(report);
        let Some(prompt) = prompt else {
            info!(rounds = outcome.rounds, "no problems remaining");
            outcome.stop = RepairStop::Clean;
            return Ok(outcome);
        };
        if outcome.rounds >= config.max_rounds {
            warn!(rounds = outcome.rounds, problems = problem_count, "giving up on auto-repair");
            outcome.stop = RepairStop::GaveUp;
            return Ok(outcome);
        }

        outcome.rounds += 1;
        info!(round = outcome.rounds, problems = problem_count, "requesting fixes");
        transcript = transcript.followed_by([ChatMessage::user(prompt)]);
        let fixed = consume_stream(client, &transcript, session, config.max_continuations, |_| {})?;
        if fixed.cancelled {
            outcome.stop = RepairStop::Cancelled;
            return Ok(outcome);
        }
        transcript = transcript.followed_by([ChatMessage::assistant(fixed.text.clone())]);
        outcome
            .operations
            .extend(fixed.parsed.completed_operations());
        outcome.responses.push(fixed.text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChatMode, Problem};
    use crate::io::checker::CheckError;
    use crate::test_support::{ScriptedChecker, ScriptedModel};

    fn problem(file: &str) -> ProblemReport {
        ProblemReport {
            problems: vec![Problem {
                file: file.to_string(),
                line: 1,
                column: 1,
                code: 2304,
                message: "Cannot find name 'x'.".to_string(),
                snippet: None,
            }],
        }
    }

    fn write_op(path: &str, content: &str) -> Operation {
        Operation::Write {
            path: path.to_string(),
            description: None,
            content: content.to_string(),
        }
    }

    fn config() -> RepairConfig {
        RepairConfig {
            max_rounds: 2,
            max_continuations: 2,
        }
    }

    #[test]
    fn two_failing_rounds_then_clean() {
        let root = tempfile::tempdir().expect("tempdir");
        let session = TurnSession::detached(1, 1, ChatMode::Build);
        let model = ScriptedModel::new(vec![
            vec!["<dyad-write path=\"a.ts\">fix 1</dyad-write>"],
            vec!["<dyad-write path=\"a.ts\">fix 2</dyad-write>"],
        ]);
        let checker = ScriptedChecker::new(vec![
            Ok(problem("a.ts")),
            Ok(problem("a.ts")),
            Ok(ProblemReport::default()),
        ]);
        let outcome = run_repair(
            root.path(),
            &session,
            &model,
            &checker,
            &ModelRequest::new(vec![ChatMessage::user("build it")]),
            "<dyad-write path=\"a.ts\">broken</dyad-write>",
            vec![write_op("a.ts", "broken")],
            config(),
        )
        .expect("repair");

        assert_eq!(outcome.stop, RepairStop::Clean);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(model.requests().len(), 2);
        assert_eq!(
            outcome.operations,
            vec![
                write_op("a.ts", "broken"),
                write_op("a.ts", "fix 1"),
                write_op("a.ts", "fix 2")
            ]
        );
        // Each check saw the operations merged so far.
        let seen: Vec<usize> = checker.calls().iter().map(Vec::len).collect();
        assert_eq!(seen, vec![1, 2, 3]);

        let second = &model.requests()[1];
        let prompts: Vec<&str> = second
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(prompts[0], "build it");
        assert!(prompts[2].starts_with("Fix these 1 TypeScript compile-time error"));
        assert_eq!(prompts[3], "<dyad-write path=\"a.ts\">fix 1</dyad-write>");
    }

    #[test]
    fn gives_up_after_max_rounds() {
        let root = tempfile::tempdir().expect("tempdir");
        let session = TurnSession::detached(1, 1, ChatMode::Build);
        let model = ScriptedModel::new(vec![vec!["no tags"], vec!["still none"]]);
        let checker = ScriptedChecker::new(vec![
            Ok(problem("a.ts")),
            Ok(problem("a.ts")),
            Ok(problem("a.ts")),
        ]);
        let outcome = run_repair(
            root.path(),
            &session,
            &model,
            &checker,
            &ModelRequest::default(),
            "",
            vec![write_op("a.ts", "x")],
            config(),
        )
        .expect("repair");
        assert_eq!(outcome.stop, RepairStop::GaveUp);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.report, Some(problem("a.ts")));
        assert_eq!(outcome.responses, vec!["no tags".to_string(), "still none".to_string()]);
    }

    #[test]
    fn skipped_for_ask_mode_and_pending_installs() {
        let root = tempfile::tempdir().expect("tempdir");
        let model = ScriptedModel::new(Vec::new());
        let checker = ScriptedChecker::new(Vec::new());

        let ask = TurnSession::detached(1, 1, ChatMode::Ask);
        let outcome = run_repair(
            root.path(),
            &ask,
            &model,
            &checker,
            &ModelRequest::default(),
            "",
            vec![write_op("a.ts", "x")],
            config(),
        )
        .expect("repair");
        assert_eq!(outcome.stop, RepairStop::Skipped(SkipReason::ReadOnlyMode));

        let build = TurnSession::detached(1, 1, ChatMode::Build);
        let outcome = run_repair(
            root.path(),
            &build,
            &model,
            &checker,
            &ModelRequest::default(),
            "",
            vec![Operation::AddDependency {
                packages: vec!["zod".to_string()],
            }],
            config(),
        )
        .expect("repair");
        assert_eq!(
            outcome.stop,
            RepairStop::Skipped(SkipReason::PendingDependencyInstall)
        );
        assert!(checker.calls().is_empty());
    }

    #[test]
    fn cancellation_stops_before_checking() {
        let root = tempfile::tempdir().expect("tempdir");
        let session = TurnSession::detached(1, 1, ChatMode::Build);
        session.cancel_token().cancel();
        let model = ScriptedModel::new(Vec::new());
        let checker = ScriptedChecker::new(vec![Ok(problem("a.ts"))]);
        let outcome = run_repair(
            root.path(),
            &session,
            &model,
            &checker,
            &ModelRequest::default(),
            "",
            vec![write_op("a.ts", "x")],
            config(),
        )
        .expect("repair");
        assert_eq!(outcome.stop, RepairStop::Cancelled);
        assert!(checker.calls().is_empty());
        assert!(model.requests().is_empty());
    }

    #[test]
    fn checker_failure_stops_without_verdict() {
        let root = tempfile::tempdir().expect("tempdir");
        let session = TurnSession::detached(1, 1, ChatMode::Build);
        let model = ScriptedModel::new(Vec::new());
        let checker = ScriptedChecker::new(vec![Err(CheckError::WorkerCrashed("boom".to_string()))]);
        let outcome = run_repair(
            root.path(),
            &session,
            &model,
            &checker,
            &ModelRequest::default(),
            "",
            vec![write_op("a.ts", "x")],
            config(),
        )
        .expect("repair");
        assert!(matches!(outcome.stop, RepairStop::CheckFailed(ref msg) if msg.contains("boom")));
        assert_eq!(outcome.report, None);
    }
}
