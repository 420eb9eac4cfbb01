//! Virtual filesystem: an [`OverlayState`] on top of a fallback directory.
//!
//! [`VirtualFs`] consults a blocking [`FsDelegate`]; [`AsyncVirtualFs`]
//! consults an [`AsyncFsDelegate`]. Both expose the same operations with the
//! same semantics; only the fallback I/O differs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::overlay::{Lookup, OverlayState, apply_order};
use crate::core::path::{normalize_rel_path, safe_join};
use crate::core::types::Operation;

/// Blocking fallback for paths the overlay has not touched.
pub trait FsDelegate {
    fn exists(&self, path: &str) -> bool;
    fn read(&self, path: &str) -> Result<Option<String>>;
}

/// Non-blocking fallback for paths the overlay has not touched.
#[allow(async_fn_in_trait)]
pub trait AsyncFsDelegate {
    async fn exists(&self, path: &str) -> bool;
    async fn read(&self, path: &str) -> Result<Option<String>>;
}

/// Real files under a project root, read with `std::fs`.
#[derive(Debug, Clone)]
pub struct DiskDelegate {
    root: PathBuf,
}

impl DiskDelegate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FsDelegate for DiskDelegate {
    fn exists(&self, path: &str) -> bool {
        safe_join(&self.root, path).is_ok_and(|p| p.exists())
    }

    fn read(&self, path: &str) -> Result<Option<String>> {
        let full = safe_join(&self.root, path)?;
        match std::fs::read_to_string(&full) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", full.display())),
        }
    }
}

/// Real files under a project root, read with `tokio::fs`.
#[derive(Debug, Clone)]
pub struct TokioDiskDelegate {
    root: PathBuf,
}

impl TokioDiskDelegate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AsyncFsDelegate for TokioDiskDelegate {
    async fn exists(&self, path: &str) -> bool {
        match safe_join(&self.root, path) {
            Ok(full) => tokio::fs::try_exists(&full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        let full = safe_join(&self.root, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", full.display())),
        }
    }
}

/// Overlay with a blocking fallback.
#[derive(Debug, Clone)]
pub struct VirtualFs<D> {
    state: OverlayState,
    delegate: D,
}

impl<D: FsDelegate> VirtualFs<D> {
    pub fn new(delegate: D) -> Self {
        Self {
            state: OverlayState::new(),
            delegate,
        }
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn write(&mut self, path: &str, content: impl Into<String>) -> Result<()> {
        let path = normalize_rel_path(path)?;
        self.state.write(&path, content);
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        let path = normalize_rel_path(path)?;
        self.state.delete(&path);
        Ok(())
    }

    /// Returns false (and changes nothing) when `from` does not exist.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<bool> {
        let from = normalize_rel_path(from)?;
        let to = normalize_rel_path(to)?;
        if !self.exists(&from) {
            debug!(%from, %to, "rename source missing, skipping");
            return Ok(false);
        }
        self.state.rename(&from, &to);
        Ok(true)
    }

    pub fn exists(&self, path: &str) -> bool {
        let Ok(path) = normalize_rel_path(path) else {
            return false;
        };
        match self.state.lookup(&path) {
            Lookup::Deleted => false,
            Lookup::Written(_) => true,
            Lookup::Fallback(source) => {
                self.delegate.exists(&source) || self.state.has_writes_under(&path)
            }
        }
    }

    pub fn read(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_rel_path(path)?;
        match self.state.lookup(&path) {
            Lookup::Deleted => Ok(None),
            Lookup::Written(content) => Ok(Some(content.to_string())),
            Lookup::Fallback(source) => self.delegate.read(&source),
        }
    }

    /// Replay file operations in delete, rename, write order.
    pub fn apply_operations(&mut self, operations: &[Operation]) -> Result<()> {
        for op in apply_order(operations) {
            match op {
                Operation::Delete { path } => self.delete(path)?,
                Operation::Rename { from, to } => {
                    self.rename(from, to)?;
                }
                Operation::Write { path, content, .. } => self.write(path, content.as_str())?,
                Operation::AddDependency { .. } | Operation::ExecuteSql { .. } => {}
            }
        }
        Ok(())
    }
}

/// Overlay with a non-blocking fallback.
#[derive(Debug, Clone)]
pub struct AsyncVirtualFs<D> {
    state: OverlayState,
    delegate: D,
}

impl<D: AsyncFsDelegate> AsyncVirtualFs<D> {
    pub fn new(delegate: D) -> Self {
        Self {
            state: OverlayState::new(),
            delegate,
        }
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    pub fn write(&mut self, path: &str, content: impl Into<String>) -> Result<()> {
        let path = normalize_rel_path(path)?;
        self.state.write(&path, content);
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        let path = normalize_rel_path(path)?;
        self.state.delete(&path);
        Ok(())
    }

    /// Returns false (and changes nothing) when `from` does not exist.
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<bool> {
        let from = normalize_rel_path(from)?;
        let to = normalize_rel_path(to)?;
        if !self.exists(&from).await {
            debug!(%from, %to, "rename source missing, skipping");
            return Ok(false);
        }
        self.state.rename(&from, &to);
        Ok(true)
    }

    pub async fn exists(&self, path: &str) -> bool {
        let Ok(path) = normalize_rel_path(path) else {
            return false;
        };
        match self.state.lookup(&path) {
            Lookup::Deleted => false,
            Lookup::Written(_) => true,
            Lookup::Fallback(source) => {
                self.delegate.exists(&source).await || self.state.has_writes_under(&path)
            }
        }
    }

    pub async fn read(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_rel_path(path)?;
        match self.state.lookup(&path) {
            Lookup::Deleted => Ok(None),
            Lookup::Written(content) => Ok(Some(content.to_string())),
            Lookup::Fallback(source) => self.delegate.read(&source).await,
        }
    }

    /// Replay file operations in delete, rename, write order.
    pub async fn apply_operations(&mut self, operations: &[Operation]) -> Result<()> {
        for op in apply_order(operations) {
            match op {
                Operation::Delete { path } => self.delete(path)?,
                Operation::Rename { from, to } => {
                    self.rename(from, to).await?;
                }
                Operation::Write { path, content, .. } => self.write(path, content.as_str())?,
                Operation::AddDependency { .. } | Operation::ExecuteSql { .. } => {}
            }
        }
        Ok(())
    }
}
