//! Package installation for `AddDependency` operations.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::io::config::InstallConfig;
use crate::io::process::{display_command, run_command_with_timeout};

/// Manifest and lock files staged after every install attempt, when present.
pub const MANIFEST_FILES: [&str; 4] = [
    "package.json",
    "pnpm-lock.yaml",
    "package-lock.json",
    "yarn.lock",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub success: bool,
    /// Combined output of every attempt, for display.
    pub log: String,
}

pub trait PackageInstaller: Send + Sync {
    fn install(&self, root: &Path, packages: &[String]) -> Result<InstallOutcome>;
}

/// Tries each configured command in order until one succeeds.
#[derive(Debug, Clone)]
pub struct ShellInstaller {
    config: InstallConfig,
}

impl ShellInstaller {
    pub fn new(config: InstallConfig) -> Self {
        Self { config }
    }
}

impl PackageInstaller for ShellInstaller {
    #[instrument(skip_all, fields(root = %root.display(), packages = ?packages))]
    fn install(&self, root: &Path, packages: &[String]) -> Result<InstallOutcome> {
        let mut log = String::new();
        for command in &self.config.commands {
            let Some((program, base_args)) = command.split_first() else {
                continue;
            };
            let mut args = base_args.to_vec();
            args.extend(packages.iter().cloned());
            let shown = display_command(program, &args);
            log.push_str(&format!("$ {shown}\n"));

            let mut cmd = Command::new(program);
            cmd.args(&args).current_dir(root);
            let output = match run_command_with_timeout(
                cmd,
                Duration::from_secs(self.config.timeout_secs),
                self.config.output_limit_bytes,
            ) {
                Ok(output) => output,
                Err(err) => {
                    warn!(command = %shown, err = %err, "install command could not run");
                    log.push_str(&format!("{err:#}\n"));
                    continue;
                }
            };
            log.push_str(&output.combined_text());
            if !log.ends_with('\n') {
                log.push('\n');
            }
            if output.success() {
                info!(command = %shown, "packages installed");
                return Ok(InstallOutcome { success: true, log });
            }
            warn!(command = %shown, exit_code = ?output.status.code(), "install command failed");
        }
        Ok(InstallOutcome {
            success: false,
            log,
        })
    }
}
