//! Test-only fixtures: a throwaway git project and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::core::types::{Operation, ProblemReport};
use crate::io::checker::{CheckError, ProblemChecker};
use crate::io::git::{Author, Git};
use crate::io::installer::{InstallOutcome, PackageInstaller};
use crate::io::model::{ChunkStream, ModelClient, ModelRequest};
use crate::io::sql::SqlExecutor;

/// A git repository in a temp dir with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let git = Git::new(dir.path());
        git.init()?;
        fs::write(dir.path().join("README.md"), "# app\n").context("write README")?;
        git.add_paths(&["README.md"])?;
        git.commit_staged("init", &Self::author())?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.dir.path())
    }

    pub fn author() -> Author {
        Author {
            name: "Test".to_string(),
            email: "test@example.com".to_string(),
        }
    }

    /// Write `rel` (creating parents) without staging it.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Write, stage and commit `rel`.
    pub fn commit_file(&self, rel: &str, contents: &str) -> Result<()> {
        self.write(rel, contents)?;
        let git = self.git();
        git.add_paths(&[rel])?;
        git.commit_staged(&format!("add {rel}"), &Self::author())?;
        Ok(())
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.dir.path().join(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.dir.path().join(rel).exists()
    }
}

/// Replays one scripted response per request and records every request.
pub struct ScriptedModel {
    rounds: Mutex<VecDeque<Vec<String>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(rounds: Vec<Vec<&str>>) -> Self {
        let rounds = rounds
            .into_iter()
            .map(|chunks| chunks.into_iter().map(str::to_string).collect())
            .collect();
        Self {
            rounds: Mutex::new(rounds),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn stream(&self, request: &ModelRequest) -> Result<ChunkStream<'_>> {
        self.requests.lock().push(request.clone());
        let chunks = self
            .rounds
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no more responses"))?;
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }
}

/// Returns queued check results in order, then clean reports.
pub struct ScriptedChecker {
    results: Mutex<VecDeque<Result<ProblemReport, CheckError>>>,
    calls: Mutex<Vec<Vec<Operation>>>,
}

impl ScriptedChecker {
    pub fn new(results: Vec<Result<ProblemReport, CheckError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Operation lists seen by each check, in call order.
    pub fn calls(&self) -> Vec<Vec<Operation>> {
        self.calls.lock().clone()
    }
}

impl ProblemChecker for ScriptedChecker {
    fn check(&self, _root: &Path, operations: &[Operation]) -> Result<ProblemReport, CheckError> {
        self.calls.lock().push(operations.to_vec());
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ProblemReport::default()))
    }
}

/// Records install requests; on success writes a `package.json` listing them.
pub struct RecordingInstaller {
    succeed: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingInstaller {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

impl PackageInstaller for RecordingInstaller {
    fn install(&self, root: &Path, packages: &[String]) -> Result<InstallOutcome> {
        self.calls.lock().push(packages.to_vec());
        if !self.succeed {
            return Ok(InstallOutcome {
                success: false,
                log: format!("ERR_PNPM_FETCH_404 {}", packages.join(" ")),
            });
        }
        let deps: serde_json::Map<String, serde_json::Value> = packages
            .iter()
            .map(|name| (name.clone(), serde_json::Value::from("^1.0.0")))
            .collect();
        let manifest = serde_json::json!({ "dependencies": deps });
        fs::write(
            root.join("package.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(InstallOutcome {
            success: true,
            log: format!("added {} packages", packages.len()),
        })
    }
}

/// Records executed statements; fails every statement when built with `failing`.
#[derive(Default)]
pub struct FakeSql {
    failure: Option<String>,
    statements: Mutex<Vec<String>>,
}

impl FakeSql {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            statements: Mutex::new(Vec::new()),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }
}

impl SqlExecutor for FakeSql {
    fn execute(&self, sql: &str) -> Result<()> {
        self.statements.lock().push(sql.to_string());
        match &self.failure {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}
