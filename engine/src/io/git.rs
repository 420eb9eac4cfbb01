//! Git adapter for the apply engine.
//!
//! The engine stages exactly the paths it touched and commits once per turn,
//! so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// One entry of `git status --porcelain=v1 -z`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// XY status code; `??` marks untracked files.
    pub code: String,
    pub path: String,
}

/// Commit identity passed with `-c user.name=… -c user.email=…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// `git` subprocess calls rooted at one project directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the workdir is the top of a git repository.
    pub fn is_repo(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// `git init` with `main` as the initial branch.
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "-q", "-b", "main"])?;
        Ok(())
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Subject and body of the HEAD commit.
    pub fn head_message(&self) -> Result<String> {
        let out = self.run_capture(&["log", "-1", "--format=%B"])?;
        Ok(out.trim().to_string())
    }

    /// Number of commits reachable from HEAD (0 for an unborn branch).
    pub fn commit_count(&self) -> Result<usize> {
        let out = self.run(&["rev-list", "--count", "HEAD"])?;
        if !out.status.success() {
            return Ok(0);
        }
        let text = String::from_utf8_lossy(&out.stdout);
        text.trim()
            .parse()
            .with_context(|| format!("parse commit count '{}'", text.trim()))
    }

    /// Every changed, staged or untracked path, one entry per file.
    ///
    /// NUL-separated output keeps paths verbatim; the line format would
    /// C-quote anything outside printable ASCII.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        parse_status(&self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?)
    }

    /// True if `path` is excluded by a gitignore rule.
    pub fn is_ignored(&self, path: &str) -> Result<bool> {
        let out = self.run(&["check-ignore", "-q", "--", path])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git check-ignore {path} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Stage additions, modifications and removals for the given paths.
    pub fn add_paths(&self, paths: &[&str]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["--literal-pathspecs", "add", "-A", "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Stage the removal of `path` (recursively); untracked paths are ignored.
    pub fn remove_cached(&self, path: &str) -> Result<()> {
        self.run_checked(&[
            "--literal-pathspecs",
            "rm",
            "-r",
            "--cached",
            "--ignore-unmatch",
            "-q",
            "--",
            path,
        ])?;
        Ok(())
    }

    /// True if the index differs from HEAD.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--quiet"])?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(anyhow!(
                "git diff --cached failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Commit the index as `author`. Returns false, without committing, when
    /// nothing is staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str, author: &Author) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("index clean, nothing to commit");
            return Ok(false);
        }
        self.run_as(author, &["commit", "-q", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Fold staged changes into HEAD, replacing its message.
    #[instrument(skip_all)]
    pub fn amend(&self, message: &str, author: &Author) -> Result<()> {
        debug!("amending head commit");
        self.run_as(
            author,
            &["commit", "-q", "--no-verify", "--amend", "-m", message],
        )?;
        Ok(())
    }

    fn run_as(&self, author: &Author, args: &[&str]) -> Result<Output> {
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        let mut full = vec!["-c", name.as_str(), "-c", email.as_str()];
        full.extend_from_slice(args);
        self.run_checked(&full)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        self.run_checked(args)
            .map(|output| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status(output: &str) -> Result<Vec<StatusEntry>> {
    let mut records = output.split('\0').filter(|record| !record.is_empty());
    let mut entries = Vec::new();
    while let Some(record) = records.next() {
        let (Some(code), Some(path)) = (record.get(..2), record.get(3..)) else {
            return Err(anyhow!("unexpected porcelain record: '{record}'"));
        };
        // Renames and copies name the destination, then the source.
        if code.contains(['R', 'C']) {
            records.next();
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    Ok(entries)
}
