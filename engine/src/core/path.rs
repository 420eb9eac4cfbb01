//! Project-relative path normalization.
//!
//! Every path named by an operation goes through [`normalize_rel_path`] before
//! it reaches the overlay or the disk. Normalization is purely lexical; symlinks
//! inside the project are not resolved.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path `{0}` is absolute; expected a project-relative path")]
    Absolute(String),
    #[error("path `{0}` escapes the project root")]
    EscapesRoot(String),
}

/// Normalize to forward-slash form with `.`/`..` resolved.
///
/// Backslashes are treated as separators. A `..` that would climb above the
/// project root is rejected rather than clamped.
pub fn normalize_rel_path(path: &str) -> Result<String, PathError> {
    let unified = path.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(PathError::Empty);
    }
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(PathError::Absolute(path.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathError::EscapesRoot(path.to_string()));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Join a validated relative path onto `root`.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    let normalized = normalize_rel_path(rel)?;
    Ok(normalized
        .split('/')
        .fold(root.to_path_buf(), |acc, part| acc.join(part)))
}

/// Render a path under `root` as a forward-slash relative path.
pub fn to_rel_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
