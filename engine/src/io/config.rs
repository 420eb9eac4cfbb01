//! Engine configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// Missing fields default to the values the engine ships with, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the auto-repair loop after a response finishes.
    pub auto_fix_problems: bool,

    /// Follow-up model turns the repair loop may request.
    pub max_repair_rounds: u32,

    /// Extra model rounds requested when a response ends inside a write.
    pub max_continuations: u32,

    /// How long an apply pass waits for the per-project lock; 0 fails at once.
    pub lock_timeout_secs: u64,

    /// Where durable turn records are written. Unset disables them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_dir: Option<PathBuf>,

    pub checker: CheckerConfig,
    pub install: InstallConfig,
    pub git: GitConfig,
    pub sql: SqlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckerConfig {
    /// Type-check command; `-p <tsconfig> --noEmit --pretty false` is appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            command: vec!["npx".to_string(), "tsc".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallConfig {
    /// Install commands tried in order until one succeeds; packages are appended.
    pub commands: Vec<Vec<String>>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            commands: vec![
                vec!["pnpm".to_string(), "add".to_string()],
                vec![
                    "npm".to_string(),
                    "install".to_string(),
                    "--legacy-peer-deps".to_string(),
                ],
            ],
            timeout_secs: 600,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: "Dyad AI".to_string(),
            author_email: "dyad-ai@example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SqlConfig {
    /// Persist a numbered migration file after each successful statement batch.
    pub write_migrations: bool,
    /// Project-relative directory for migration files.
    pub migrations_dir: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            write_migrations: true,
            migrations_dir: "supabase/migrations".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_fix_problems: true,
            max_repair_rounds: 2,
            max_continuations: 2,
            lock_timeout_secs: 300,
            history_dir: None,
            checker: CheckerConfig::default(),
            install: InstallConfig::default(),
            git: GitConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.checker.command.is_empty() || self.checker.command[0].trim().is_empty() {
            return Err(anyhow!("checker.command must be a non-empty array"));
        }
        if self.checker.timeout_secs == 0 {
            return Err(anyhow!("checker.timeout_secs must be > 0"));
        }
        if self.checker.output_limit_bytes == 0 {
            return Err(anyhow!("checker.output_limit_bytes must be > 0"));
        }
        if self
            .install
            .commands
            .iter()
            .any(|cmd| cmd.is_empty() || cmd[0].trim().is_empty())
        {
            return Err(anyhow!("install.commands entries must be non-empty arrays"));
        }
        if self.install.timeout_secs == 0 {
            return Err(anyhow!("install.timeout_secs must be > 0"));
        }
        if self.git.author_name.trim().is_empty() || self.git.author_email.trim().is_empty() {
            return Err(anyhow!("git.author_name and git.author_email must be set"));
        }
        crate::core::path::normalize_rel_path(&self.sql.migrations_dir)
            .map_err(|err| anyhow!("sql.migrations_dir: {err}"))?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
