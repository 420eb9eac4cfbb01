//! Transactional apply engine.
//!
//! The only component that mutates a real project. One pass, under the
//! per-project lock:
//!
//! 1. validate every path before touching anything
//! 2. delete, rename, write (the same order the overlay replays)
//! 3. install dependencies, then run SQL
//! 4. commit everything staged as one commit
//! 5. fold files changed outside the engine into that commit with an amend
//!
//! A filesystem failure stops the remaining file operations and is reported as
//! the top-level error. Operations already applied stay applied and nothing is
//! committed.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::overlay::apply_order;
use crate::core::path::{normalize_rel_path, safe_join};
use crate::core::types::{CommitRecord, Operation};
use crate::io::config::EngineConfig;
use crate::io::git::{Author, Git};
use crate::io::installer::{MANIFEST_FILES, PackageInstaller};
use crate::io::lock::ProjectLock;
use crate::io::sql::{SqlExecutor, write_migration};
use crate::session::TurnSession;

/// What one apply pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub files_changed: bool,
    /// Project-relative paths created, modified, moved or removed.
    pub touched_paths: Vec<String>,
    /// Partial-operation failures and benign skips worth showing.
    pub warnings: Vec<String>,
    /// Failed SQL statements.
    pub errors: Vec<String>,
    /// Failure that stopped the pass.
    pub error: Option<String>,
    /// Paths folded into the commit that the engine did not write itself.
    pub extra_files: Vec<String>,
    pub extra_files_error: Option<String>,
    /// Output of each dependency install, in operation order.
    pub dependency_logs: Vec<String>,
    pub commit: Option<CommitRecord>,
}

/// Collaborators for the non-file operations.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub installer: &'a dyn PackageInstaller,
    /// `None` when the project has no database integration.
    pub sql: Option<&'a dyn SqlExecutor>,
}

#[derive(Debug, Default)]
struct Counts {
    written: usize,
    renamed: usize,
    deleted: usize,
    packages: usize,
    sql: usize,
}

/// Apply a finalized operation list to the project at `root`.
#[instrument(skip_all, fields(root = %root.display(), chat_id = session.chat_id, message_id = session.message_id, operations = operations.len()))]
pub fn apply_operations(
    root: &Path,
    session: &TurnSession,
    operations: &[Operation],
    chat_summary: Option<&str>,
    config: &EngineConfig,
    collaborators: Collaborators<'_>,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    if operations.is_empty() {
        return outcome;
    }
    if !session.mode.allows_file_changes() {
        debug!("read-only chat mode, nothing applied");
        return outcome;
    }
    if session.is_cancelled() {
        info!("turn cancelled, nothing applied");
        return outcome;
    }

    if let Err(err) = apply_locked(
        root,
        session,
        operations,
        chat_summary,
        config,
        collaborators,
        &mut outcome,
    ) {
        warn!(err = %err, "apply failed");
        outcome.error = Some(format!("{err:#}"));
    }
    outcome
}

fn apply_locked(
    root: &Path,
    session: &TurnSession,
    operations: &[Operation],
    chat_summary: Option<&str>,
    config: &EngineConfig,
    collaborators: Collaborators<'_>,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    let git = Git::new(root);
    if !git.is_repo() {
        return Err(anyhow!("{} is not a git repository", root.display()));
    }
    let operations = validate_paths(operations)?;
    let _lock = ProjectLock::acquire(root, Duration::from_secs(config.lock_timeout_secs))?;

    let mut counts = Counts::default();
    for op in apply_order(&operations) {
        apply_file_operation(root, &git, session, op, &mut counts, outcome)?;
    }

    for op in &operations {
        if let Operation::AddDependency { packages } = op {
            install_packages(
                root,
                &git,
                collaborators.installer,
                packages,
                &mut counts,
                outcome,
            );
        }
    }

    for op in &operations {
        if let Operation::ExecuteSql {
            content,
            description,
        } = op
        {
            run_sql(
                root,
                &git,
                config,
                collaborators.sql,
                content,
                description.as_deref(),
                &mut counts,
                outcome,
            );
        }
    }

    let author = Author {
        name: config.git.author_name.clone(),
        email: config.git.author_email.clone(),
    };
    let message = commit_message(chat_summary, &counts);
    if !git.commit_staged(&message, &author)? {
        info!("nothing staged, no commit");
        return Ok(());
    }
    outcome.files_changed = true;
    outcome.commit = Some(CommitRecord {
        sha: git.head_sha()?,
        message_id: session.message_id,
        message: message.clone(),
    });
    info!(message = %message, "committed turn");

    reconcile(&git, &author, &message, session.message_id, outcome);
    Ok(())
}

/// Normalize every path up front so a bad path fails the pass before any change.
fn validate_paths(operations: &[Operation]) -> Result<Vec<Operation>> {
    let norm = |path: &str| {
        normalize_rel_path(path).with_context(|| format!("invalid path in operation: {path}"))
    };
    operations
        .iter()
        .map(|op| -> Result<Operation> {
            Ok(match op {
                Operation::Write {
                    path,
                    description,
                    content,
                } => Operation::Write {
                    path: norm(path)?,
                    description: description.clone(),
                    content: content.clone(),
                },
                Operation::Rename { from, to } => Operation::Rename {
                    from: norm(from)?,
                    to: norm(to)?,
                },
                Operation::Delete { path } => Operation::Delete { path: norm(path)? },
                other => other.clone(),
            })
        })
        .collect()
}

fn apply_file_operation(
    root: &Path,
    git: &Git,
    session: &TurnSession,
    op: &Operation,
    counts: &mut Counts,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    match op {
        Operation::Delete { path } => {
            let full = safe_join(root, path)?;
            let meta = match fs::symlink_metadata(&full) {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(%path, "delete target missing, skipping");
                    return Ok(());
                }
                Err(err) => return Err(err).with_context(|| format!("stat {}", full.display())),
            };
            if meta.is_dir() {
                fs::remove_dir_all(&full)
            } else {
                fs::remove_file(&full)
            }
            .with_context(|| format!("delete {path}"))?;
            git.remove_cached(path)?;
            counts.deleted += 1;
            outcome.touched_paths.push(path.clone());
            debug!(%path, "deleted");
        }
        Operation::Rename { from, to } => {
            let source = safe_join(root, from)?;
            if fs::symlink_metadata(&source).is_err() {
                debug!(%from, %to, "rename source missing, skipping");
                return Ok(());
            }
            let target = safe_join(root, to)?;
            create_parent(&target)?;
            fs::rename(&source, &target).with_context(|| format!("rename {from} to {to}"))?;
            git.remove_cached(from)?;
            stage(git, to)?;
            counts.renamed += 1;
            outcome.touched_paths.push(from.clone());
            outcome.touched_paths.push(to.clone());
            debug!(%from, %to, "renamed");
        }
        Operation::Write { path, content, .. } => {
            let target = safe_join(root, path)?;
            create_parent(&target)?;
            match session.uploads.resolve(content) {
                Some(source) => {
                    fs::copy(source, &target).with_context(|| {
                        format!("copy upload {} to {path}", source.display())
                    })?;
                }
                None => fs::write(&target, content).with_context(|| format!("write {path}"))?,
            }
            stage(git, path)?;
            counts.written += 1;
            outcome.touched_paths.push(path.clone());
            debug!(%path, bytes = content.len(), "wrote");
        }
        Operation::AddDependency { .. } | Operation::ExecuteSql { .. } => {}
    }
    Ok(())
}

fn install_packages(
    root: &Path,
    git: &Git,
    installer: &dyn PackageInstaller,
    packages: &[String],
    counts: &mut Counts,
    outcome: &mut ApplyOutcome,
) {
    match installer.install(root, packages) {
        Ok(result) => {
            outcome.dependency_logs.push(result.log);
            if result.success {
                counts.packages += packages.len();
            } else {
                outcome
                    .warnings
                    .push(format!("Failed to install packages: {}", packages.join(" ")));
            }
        }
        Err(err) => {
            warn!(err = %err, "package install errored");
            outcome.warnings.push(format!(
                "Failed to install packages: {}: {err:#}",
                packages.join(" ")
            ));
        }
    }

    let manifests: Vec<&str> = MANIFEST_FILES
        .into_iter()
        .filter(|name| root.join(name).exists())
        .collect();
    if let Err(err) = git.add_paths(&manifests) {
        outcome
            .warnings
            .push(format!("Failed to stage package manifests: {err:#}"));
    }
}

#[allow(clippy::too_many_arguments)]
fn run_sql(
    root: &Path,
    git: &Git,
    config: &EngineConfig,
    executor: Option<&dyn SqlExecutor>,
    sql: &str,
    description: Option<&str>,
    counts: &mut Counts,
    outcome: &mut ApplyOutcome,
) {
    let Some(executor) = executor else {
        debug!("no database integration, skipping SQL");
        return;
    };
    if let Err(err) = executor.execute(sql) {
        warn!(err = %err, "SQL failed");
        outcome
            .errors
            .push(format!("Failed to execute SQL: {err:#}"));
        return;
    }
    counts.sql += 1;
    if !config.sql.write_migrations {
        return;
    }
    let written = write_migration(root, &config.sql.migrations_dir, description, sql)
        .and_then(|path| stage(git, &path).map(|()| path));
    match written {
        Ok(path) => outcome.touched_paths.push(path),
        Err(err) => outcome
            .warnings
            .push(format!("Failed to write migration file: {err:#}")),
    }
}

/// Stage `path` unless a gitignore rule excludes it.
fn stage(git: &Git, path: &str) -> Result<()> {
    if git.is_ignored(path)? {
        debug!(%path, "ignored by git, not staging");
        return Ok(());
    }
    git.add_paths(&[path])
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    Ok(())
}

/// Stage whatever is still dirty after the commit and amend it in.
fn reconcile(git: &Git, author: &Author, message: &str, message_id: i64, outcome: &mut ApplyOutcome) {
    let entries = match git.status_porcelain() {
        Ok(entries) => entries,
        Err(err) => {
            outcome.extra_files_error = Some(format!("{err:#}"));
            return;
        }
    };
    if entries.is_empty() {
        return;
    }
    outcome.extra_files = entries.into_iter().map(|entry| entry.path).collect();
    info!(count = outcome.extra_files.len(), "folding extra files into commit");

    let amended = format!("{message} + extra files edited outside of Dyad");
    let paths: Vec<&str> = outcome.extra_files.iter().map(String::as_str).collect();
    let result = git
        .add_paths(&paths)
        .and_then(|()| git.amend(&amended, author))
        .and_then(|()| git.head_sha());
    match result {
        Ok(sha) => {
            outcome.commit = Some(CommitRecord {
                sha,
                message_id,
                message: amended,
            });
        }
        Err(err) => {
            warn!(err = %err, "amend with extra files failed");
            outcome.extra_files_error = Some(format!("{err:#}"));
        }
    }
}

/// `[dyad] {summary} - wrote N file(s), …`, listing only non-zero counts.
fn commit_message(summary: Option<&str>, counts: &Counts) -> String {
    let mut changes = Vec::new();
    if counts.written > 0 {
        changes.push(format!("wrote {} file(s)", counts.written));
    }
    if counts.renamed > 0 {
        changes.push(format!("renamed {} file(s)", counts.renamed));
    }
    if counts.deleted > 0 {
        changes.push(format!("deleted {} file(s)", counts.deleted));
    }
    if counts.packages > 0 {
        changes.push(format!("added {} package(s)", counts.packages));
    }
    if counts.sql > 0 {
        changes.push(format!("executed {} SQL queries", counts.sql));
    }
    let changes = changes.join(", ");
    match (summary.map(str::trim).filter(|s| !s.is_empty()), changes.is_empty()) {
        (Some(summary), false) => format!("[dyad] {summary} - {changes}"),
        (Some(summary), true) => format!("[dyad] {summary}"),
        (None, false) => format!("[dyad] {changes}"),
        (None, true) => "[dyad] applied changes".to_string(),
    }
}
