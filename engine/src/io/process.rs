//! Child processes with timeouts and bounded output.
//!
//! Used by the type checker and the package installer, both of which run
//! third-party tooling that can hang or print without bound.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output pipe, plus how many were dropped past the limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout then stderr, annotated with truncation and timeout notes.
    pub fn combined_text(&self) -> String {
        let mut out = self.stdout.text();
        if self.stdout.dropped > 0 {
            out.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout.dropped));
        }
        let stderr = self.stderr.text();
        if !stderr.trim().is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&stderr);
        }
        if self.stderr.dropped > 0 {
            out.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr.dropped));
        }
        if self.timed_out {
            out.push_str("\n[timed out]\n");
        }
        out
    }
}

/// `program arg1 arg2`, for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut shown = program.to_string();
    for arg in args {
        shown.push(' ');
        shown.push_str(arg);
    }
    shown
}

/// Run `cmd` with stdin closed, killing it after `timeout`.
///
/// Both pipes are drained on their own threads while the child runs, so a
/// chatty child never blocks on a full pipe. At most `limit` bytes per pipe
/// are kept.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    limit: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    let stdout = drain(child.stdout.take(), limit)?;
    let stderr = drain(child.stderr.take(), limit)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    let output = CommandOutput {
        status,
        stdout: join(stdout).context("collect stdout")?,
        stderr: join(stderr).context("collect stderr")?,
        timed_out,
    };
    if output.stdout.dropped > 0 || output.stderr.dropped > 0 {
        warn!(
            stdout_dropped = output.stdout.dropped,
            stderr_dropped = output.stderr.dropped,
            "command output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(output)
}

fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    limit: usize,
) -> Result<JoinHandle<Result<Captured>>> {
    let mut pipe = pipe.ok_or_else(|| anyhow!("child pipe was not captured"))?;
    Ok(thread::spawn(move || {
        let mut captured = Captured::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = pipe.read(&mut chunk).context("read child output")?;
            if n == 0 {
                return Ok(captured);
            }
            let keep = n.min(limit.saturating_sub(captured.bytes.len()));
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.dropped += n - keep;
        }
    }))
}

fn join(handle: JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_at_most_limit_bytes_per_pipe() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdef'; printf 'err' 1>&2"]);
        let out = run_command_with_timeout(cmd, Duration::from_secs(10), 3).expect("run");
        assert!(out.success());
        assert_eq!(
            out.stdout,
            Captured {
                bytes: b"abc".to_vec(),
                dropped: 3
            }
        );
        assert_eq!(out.stderr.text(), "err");
        let text = out.combined_text();
        assert!(text.contains("[stdout truncated 3 bytes]"));
        assert!(text.ends_with("err"));
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let out = run_command_with_timeout(cmd, Duration::from_millis(100), 100).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.combined_text().contains("[timed out]"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cmd = Command::new("dyad-engine-no-such-program");
        let err = run_command_with_timeout(cmd, Duration::from_secs(1), 100).unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }

    #[test]
    fn display_command_joins_args() {
        assert_eq!(
            display_command("pnpm", &["add".to_string(), "zod".to_string()]),
            "pnpm add zod"
        );
        assert_eq!(display_command("tsc", &[]), "tsc");
    }
}
