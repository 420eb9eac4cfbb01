//! Shared types for the tag protocol, overlay checks and the apply engine.
//!
//! These types are the stable contract between the parser, the repair loop and
//! the apply engine. Operation lists and commit records are persisted as part of
//! conversation history, so their serialized shape must stay stable.

use serde::{Deserialize, Serialize};

/// One structural change extracted from model output.
///
/// Paths are project-relative with forward slashes. They are validated against
/// the project root before anything touches disk (see [`crate::core::path`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Write {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        content: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Delete {
        path: String,
    },
    /// Packages are an ordered set: first occurrence wins, duplicates dropped.
    AddDependency {
        packages: Vec<String>,
    },
    ExecuteSql {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Write { .. } => OperationKind::Write,
            Operation::Rename { .. } => OperationKind::Rename,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::AddDependency { .. } => OperationKind::AddDependency,
            Operation::ExecuteSql { .. } => OperationKind::ExecuteSql,
        }
    }

    /// Project-relative paths this operation reads or writes.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Operation::Write { path, .. } | Operation::Delete { path } => vec![path.as_str()],
            Operation::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Operation::AddDependency { .. } | Operation::ExecuteSql { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Write,
    Rename,
    Delete,
    AddDependency,
    ExecuteSql,
}

/// Where a tag's markup sits in the normalized response text.
///
/// `end` is exclusive. When `in_progress` is true the closing marker was never
/// received: `end` is the end of the text seen so far and no closing marker was
/// physically appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSpan {
    pub start: usize,
    pub end: usize,
    pub in_progress: bool,
}

/// One piece of a parsed response, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    /// Non-tag text between operations, for live rendering.
    Text { text: String },
    Operation { operation: Operation, span: TagSpan },
}

/// Result of parsing (possibly incomplete) normalized response text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedResponse {
    pub segments: Vec<Segment>,
}

impl ParsedResponse {
    /// All operations with their spans, including in-progress ones.
    pub fn tagged(&self) -> impl Iterator<Item = (&Operation, &TagSpan)> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Operation { operation, span } => Some((operation, span)),
            Segment::Text { .. } => None,
        })
    }

    /// Operations whose closing marker was actually received.
    pub fn completed_operations(&self) -> Vec<Operation> {
        self.tagged()
            .filter(|(_, span)| !span.in_progress)
            .map(|(op, _)| op.clone())
            .collect()
    }

    /// Operations still waiting for their closing marker.
    pub fn in_progress(&self) -> Vec<&Operation> {
        self.tagged()
            .filter(|(_, span)| span.in_progress)
            .map(|(op, _)| op)
            .collect()
    }

    pub fn has_in_progress(&self) -> bool {
        self.tagged().any(|(_, span)| span.in_progress)
    }
}

/// One static-analysis finding against "disk ⊕ overlay".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub file: String,
    /// 1-based.
    pub line: u32,
    /// 1-based.
    pub column: u32,
    pub code: u32,
    pub message: String,
    /// Surrounding source lines, when the file could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Ordered list of findings. Empty means clean.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub problems: Vec<Problem>,
}

impl ProblemReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Version-control record for one applied turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    pub message_id: i64,
    pub message: String,
}

/// Whether the turn's chat mode allows file changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Build,
    Ask,
}

impl ChatMode {
    pub fn allows_file_changes(self) -> bool {
        matches!(self, ChatMode::Build)
    }
}
