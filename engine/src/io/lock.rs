//! Per-project mutual exclusion for apply passes.
//!
//! An exclusive advisory lock on `<root>/.git/dyad-apply.lock`. Competing
//! applies wait in line until the timeout; the lock is released on drop.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::{debug, instrument};

const LOCK_FILE: &str = "dyad-apply.lock";
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    #[instrument(skip_all, fields(root = %root.display(), timeout_secs = timeout.as_secs()))]
    pub fn acquire(root: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path(root);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let start = Instant::now();
        let mut waited = false;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(anyhow!(
                            "timed out waiting for project lock {} ({}s)",
                            path.display(),
                            timeout.as_secs()
                        ));
                    }
                    if !waited {
                        debug!("project locked by another apply, waiting");
                        waited = true;
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }
        debug!(waited_ms = start.elapsed().as_millis() as u64, "project lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(".git").join(LOCK_FILE)
}
