//! Problem checker: type-checks "disk ⊕ overlay" without touching the project.
//!
//! [`TscChecker`] copies the project (minus `node_modules` and `.git`) into a
//! scratch directory, lays the overlay on top, links `node_modules` back in and
//! runs the configured compiler there. [`CheckerWorker`] runs any checker on a
//! dedicated thread and hands the result back over a channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::overlay::{Lookup, Pending};
use crate::core::path::{safe_join, to_rel_string};
use crate::core::problem_prompt::snippet_for;
use crate::core::types::{Operation, Problem, ProblemReport};
use crate::io::config::CheckerConfig;
use crate::io::process::{display_command, run_command_with_timeout};
use crate::io::vfs::{DiskDelegate, VirtualFs};

/// Preferred first.
pub const TSCONFIG_CANDIDATES: [&str; 2] = ["tsconfig.app.json", "tsconfig.json"];

const SKIPPED_DIRS: [&str; 2] = ["node_modules", ".git"];

static DIAGNOSTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)\((\d+),(\d+)\): error TS(\d+): (.*)$").unwrap()
});

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("no {} or {} found in {}", TSCONFIG_CANDIDATES[0], TSCONFIG_CANDIDATES[1], .0.display())]
    NoTsConfig(PathBuf),
    #[error("problem checker worker crashed: {0}")]
    WorkerCrashed(String),
    #[error("problem checker timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Static analysis over the project as it would look after `operations`.
pub trait ProblemChecker: Send + Sync {
    fn check(&self, root: &Path, operations: &[Operation]) -> Result<ProblemReport, CheckError>;
}

/// Runs the TypeScript compiler in `--noEmit` mode.
#[derive(Debug, Clone)]
pub struct TscChecker {
    config: CheckerConfig,
}

impl TscChecker {
    pub fn new(config: CheckerConfig) -> Self {
        Self { config }
    }
}

impl ProblemChecker for TscChecker {
    #[instrument(skip_all, fields(root = %root.display(), operations = operations.len()))]
    fn check(&self, root: &Path, operations: &[Operation]) -> Result<ProblemReport, CheckError> {
        let mut vfs = VirtualFs::new(DiskDelegate::new(root));
        vfs.apply_operations(operations)?;
        let tsconfig = TSCONFIG_CANDIDATES
            .into_iter()
            .find(|candidate| vfs.exists(candidate))
            .ok_or_else(|| CheckError::NoTsConfig(root.to_path_buf()))?;

        let scratch = tempfile::Builder::new()
            .prefix("dyad-check-")
            .tempdir()
            .context("create scratch directory")?;
        materialize(&vfs, scratch.path())?;

        let (program, base_args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("checker.command is empty"))?;
        let mut args = base_args.to_vec();
        args.extend(
            ["-p", tsconfig, "--noEmit", "--pretty", "false"]
                .into_iter()
                .map(str::to_string),
        );
        debug!(command = %display_command(program, &args), "running type checker");
        let mut cmd = Command::new(program);
        cmd.args(&args).current_dir(scratch.path());
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(cmd, timeout, self.config.output_limit_bytes)?;
        if output.timed_out {
            return Err(CheckError::TimedOut(timeout));
        }

        let text = output.combined_text();
        let mut problems = parse_tsc_output(&text, scratch.path());
        if problems.is_empty() && !output.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                display_command(program, &args),
                output.status,
                text.trim()
            )
            .into());
        }
        for problem in &mut problems {
            problem.snippet = vfs
                .read(&problem.file)
                .ok()
                .flatten()
                .and_then(|source| snippet_for(&source, problem.line));
        }
        info!(problems = problems.len(), "type check finished");
        Ok(ProblemReport { problems })
    }
}

/// Write the overlay view of the project into `dest`.
pub(crate) fn materialize(vfs: &VirtualFs<DiskDelegate>, dest: &Path) -> anyhow::Result<()> {
    let root = vfs.delegate().root();
    let state = vfs.state();
    for_each_file(root, |path| {
        let Some(rel) = to_rel_string(root, path) else {
            return Ok(());
        };
        if matches!(state.lookup(&rel), Lookup::Fallback(source) if *source == *rel) {
            copy_into(path, &safe_join(dest, &rel)?)?;
        }
        Ok(())
    })?;

    for (rel, pending) in state.writes() {
        match pending {
            Pending::Content(content) => {
                let target = safe_join(dest, rel)?;
                create_parent(&target)?;
                fs::write(&target, content)
                    .with_context(|| format!("write {}", target.display()))?;
            }
            Pending::Moved { from } => {
                let source = safe_join(root, from)?;
                if source.is_file() {
                    copy_into(&source, &safe_join(dest, rel)?)?;
                } else if source.is_dir() {
                    // Children may be shadowed by deeper deletes or writes.
                    for_each_file(&source, |path| {
                        let Some(child) = to_rel_string(&source, path) else {
                            return Ok(());
                        };
                        let target = format!("{rel}/{child}");
                        let expected = format!("{from}/{child}");
                        if matches!(state.lookup(&target), Lookup::Fallback(found) if *found == *expected)
                        {
                            copy_into(path, &safe_join(dest, &target)?)?;
                        }
                        Ok(())
                    })?;
                }
            }
        }
    }

    let node_modules = root.join("node_modules");
    if node_modules.is_dir() {
        link_dir(&node_modules, &dest.join("node_modules"))?;
    }
    Ok(())
}

/// Visit regular files under `dir`, skipping `node_modules` and `.git`.
fn for_each_file(
    dir: &Path,
    mut visit: impl FnMut(&Path) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && SKIPPED_DIRS.iter().any(|skipped| entry.file_name() == *skipped))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            visit(entry.path())?;
        }
    }
    Ok(())
}

fn copy_into(source: &Path, target: &Path) -> anyhow::Result<()> {
    create_parent(target)?;
    fs::copy(source, target)
        .with_context(|| format!("copy {} to {}", source.display(), target.display()))?;
    Ok(())
}

fn create_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn link_dir(source: &Path, link: &Path) -> anyhow::Result<()> {
    std::os::unix::fs::symlink(source, link)
        .with_context(|| format!("link {} to {}", link.display(), source.display()))
}

#[cfg(windows)]
fn link_dir(source: &Path, link: &Path) -> anyhow::Result<()> {
    std::os::windows::fs::symlink_dir(source, link)
        .with_context(|| format!("link {} to {}", link.display(), source.display()))
}

/// Parse `file(line,col): error TSnnnn: message` diagnostics.
///
/// Indented lines after a diagnostic continue its message. Paths under
/// `scratch` are made relative to it.
pub fn parse_tsc_output(text: &str, scratch: &Path) -> Vec<Problem> {
    let mut problems: Vec<Problem> = Vec::new();
    let mut continuing = false;
    for line in text.lines() {
        if let Some(caps) = DIAGNOSTIC_RE.captures(line) {
            let (Ok(line_no), Ok(column), Ok(code)) =
                (caps[2].parse(), caps[3].parse(), caps[4].parse())
            else {
                continuing = false;
                continue;
            };
            problems.push(Problem {
                file: project_relative(&caps[1], scratch),
                line: line_no,
                column,
                code,
                message: caps[5].trim().to_string(),
                snippet: None,
            });
            continuing = true;
        } else if continuing && line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
            if let Some(last) = problems.last_mut() {
                last.message.push('\n');
                last.message.push_str(line.trim());
            }
        } else {
            continuing = false;
        }
    }
    problems
}

fn project_relative(file: &str, scratch: &Path) -> String {
    let path = Path::new(file);
    if path.is_absolute()
        && let Some(rel) = to_rel_string(scratch, path)
    {
        return rel;
    }
    file.replace('\\', "/")
        .trim_start_matches("./")
        .to_string()
}

/// Reply framing for [`CheckerWorker`].
#[derive(Debug)]
pub enum WorkerReply {
    Success(ProblemReport),
    Failure(CheckError),
}

/// Runs a checker on its own thread, bounded by a timeout.
///
/// A panicking checker surfaces as [`CheckError::WorkerCrashed`]. On timeout the
/// worker thread is abandoned and its eventual reply discarded.
#[derive(Clone)]
pub struct CheckerWorker {
    checker: Arc<dyn ProblemChecker>,
    timeout: Duration,
}

impl CheckerWorker {
    pub fn new(checker: Arc<dyn ProblemChecker>, timeout: Duration) -> Self {
        Self { checker, timeout }
    }
}

impl ProblemChecker for CheckerWorker {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn check(&self, root: &Path, operations: &[Operation]) -> Result<ProblemReport, CheckError> {
        let (tx, rx) = mpsc::channel();
        let checker = Arc::clone(&self.checker);
        let root = root.to_path_buf();
        let operations = operations.to_vec();
        thread::Builder::new()
            .name("problem-checker".to_string())
            .spawn(move || {
                let reply = match checker.check(&root, &operations) {
                    Ok(report) => WorkerReply::Success(report),
                    Err(err) => WorkerReply::Failure(err),
                };
                // The receiver is gone after a timeout.
                let _ = tx.send(reply);
            })
            .context("spawn problem checker thread")?;

        match rx.recv_timeout(self.timeout) {
            Ok(WorkerReply::Success(report)) => Ok(report),
            Ok(WorkerReply::Failure(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                warn!("problem checker timed out");
                Err(CheckError::TimedOut(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CheckError::WorkerCrashed(
                "worker exited without a reply".to_string(),
            )),
        }
    }
}
