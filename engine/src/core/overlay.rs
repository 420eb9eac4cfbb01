//! In-memory overlay state for speculative filesystem views.
//!
//! The state only records intent. Falling back to a real directory (sync or
//! async) is the job of [`crate::io::vfs`], which owns an [`OverlayState`].

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::core::types::{Operation, OperationKind};

/// Content of a path written through the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Content(String),
    /// Renamed from a file or directory whose content was never loaded; it
    /// still lives at `from` in the fallback.
    Moved { from: String },
}

/// What the overlay knows about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// Deleted, under a deleted directory, or under a path now holding a file.
    Deleted,
    Written(&'a str),
    /// Ask the fallback for this path. It differs from the requested path
    /// when the request falls under a renamed file or directory.
    Fallback(Cow<'a, str>),
}

/// Pending writes and deletes. A path is never in both.
///
/// Entries apply to everything beneath them: deleting `src/old` hides
/// `src/old/a.ts`, and moving `src/old` to `src/new` serves `src/new/a.ts`
/// from `src/old/a.ts`. The deepest entry on a path wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayState {
    writes: BTreeMap<String, Pending>,
    deletes: BTreeSet<String>,
}

impl OverlayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, path: &str, content: impl Into<String>) {
        self.deletes.remove(path);
        self.writes
            .insert(path.to_string(), Pending::Content(content.into()));
    }

    /// Delete `path` and everything beneath it.
    pub fn delete(&mut self, path: &str) {
        take_within(&mut self.writes, path);
        take_within_set(&mut self.deletes, path);
        self.deletes.insert(path.to_string());
    }

    /// Move `from` (a file or a directory) to `to`, replacing whatever was at
    /// `to`. The caller has established that `from` exists.
    pub fn rename(&mut self, from: &str, to: &str) {
        // Also covers moving a directory into itself, which fails on disk.
        if suffix_within(to, from).is_some() {
            return;
        }
        let source = if self.writes.contains_key(from) {
            None
        } else {
            match self.lookup(from) {
                Lookup::Fallback(source) => Some(source.into_owned()),
                Lookup::Deleted | Lookup::Written(_) => None,
            }
        };
        let moved_writes = take_within(&mut self.writes, from);
        let moved_deletes = take_within_set(&mut self.deletes, from);
        take_within(&mut self.writes, to);
        take_within_set(&mut self.deletes, to);

        self.deletes.insert(from.to_string());
        if let Some(source) = source {
            self.writes
                .insert(to.to_string(), Pending::Moved { from: source });
        }
        for (suffix, pending) in moved_writes {
            self.writes.insert(format!("{to}{suffix}"), pending);
        }
        for suffix in moved_deletes {
            self.deletes.insert(format!("{to}{suffix}"));
        }
    }

    pub fn lookup<'a>(&'a self, path: &'a str) -> Lookup<'a> {
        let mut candidate = path;
        loop {
            let suffix = &path[candidate.len()..];
            if self.deletes.contains(candidate) {
                return Lookup::Deleted;
            }
            match self.writes.get(candidate) {
                Some(Pending::Content(content)) if suffix.is_empty() => {
                    return Lookup::Written(content.as_str());
                }
                Some(Pending::Content(_)) => return Lookup::Deleted,
                Some(Pending::Moved { from }) if suffix.is_empty() => {
                    return Lookup::Fallback(Cow::Borrowed(from.as_str()));
                }
                Some(Pending::Moved { from }) => {
                    return Lookup::Fallback(Cow::Owned(format!("{from}{suffix}")));
                }
                None => {}
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => return Lookup::Fallback(Cow::Borrowed(path)),
            }
        }
    }

    /// True when some pending write lies strictly beneath `dir`.
    pub fn has_writes_under(&self, dir: &str) -> bool {
        let prefix = format!("{dir}/");
        self.writes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .next()
            .is_some_and(|(path, _)| path.starts_with(&prefix))
    }

    pub fn writes(&self) -> impl Iterator<Item = (&str, &Pending)> {
        self.writes.iter().map(|(path, pending)| (path.as_str(), pending))
    }

    pub fn deletes(&self) -> impl Iterator<Item = &str> {
        self.deletes.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// `""` when `path == dir`, `"/rest"` when `path` lies beneath `dir`.
fn suffix_within<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(dir)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Remove every entry at or beneath `dir`, keyed by suffix.
fn take_within<V>(map: &mut BTreeMap<String, V>, dir: &str) -> Vec<(String, V)> {
    let keys: Vec<String> = map
        .keys()
        .filter(|path| suffix_within(path, dir).is_some())
        .cloned()
        .collect();
    keys.into_iter()
        .filter_map(|path| {
            let value = map.remove(&path)?;
            Some((path[dir.len()..].to_string(), value))
        })
        .collect()
}

fn take_within_set(set: &mut BTreeSet<String>, dir: &str) -> Vec<String> {
    let taken: Vec<String> = set
        .iter()
        .filter(|path| suffix_within(path, dir).is_some())
        .cloned()
        .collect();
    for path in &taken {
        set.remove(path);
    }
    taken
        .into_iter()
        .map(|path| path[dir.len()..].to_string())
        .collect()
}

/// Operations in replay order: deletes, then renames, then writes.
///
/// Order within each kind is preserved. Non-file operations are left out.
pub fn apply_order(operations: &[Operation]) -> Vec<&Operation> {
    [OperationKind::Delete, OperationKind::Rename, OperationKind::Write]
        .into_iter()
        .flat_map(|kind| operations.iter().filter(move |op| op.kind() == kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback(path: &str) -> Lookup<'_> {
        Lookup::Fallback(Cow::Borrowed(path))
    }

    #[test]
    fn write_after_delete_wins() {
        let mut state = OverlayState::new();
        state.delete("a");
        state.write("a", "x");
        assert_eq!(state.lookup("a"), Lookup::Written("x"));
        assert_eq!(state.deletes().count(), 0);
    }

    #[test]
    fn delete_after_write_wins() {
        let mut state = OverlayState::new();
        state.write("a", "x");
        state.delete("a");
        assert_eq!(state.lookup("a"), Lookup::Deleted);
        assert_eq!(state.writes().count(), 0);
    }

    #[test]
    fn rename_of_pending_write_carries_content() {
        let mut state = OverlayState::new();
        state.write("a/b", "body");
        state.rename("a/b", "a/c");
        assert_eq!(state.lookup("a/b"), Lookup::Deleted);
        assert_eq!(state.lookup("a/c"), Lookup::Written("body"));
    }

    #[test]
    fn rename_of_untouched_path_defers_to_fallback_source() {
        let mut state = OverlayState::new();
        state.rename("a", "b");
        state.rename("b", "c");
        assert_eq!(state.lookup("a"), Lookup::Deleted);
        assert_eq!(state.lookup("b"), Lookup::Deleted);
        assert_eq!(
            state.lookup("c"),
            fallback("a")
        );
    }

    #[test]
    fn rename_onto_deleted_path_revives_it() {
        let mut state = OverlayState::new();
        state.delete("b");
        state.write("a", "x");
        state.rename("a", "b");
        assert_eq!(state.lookup("b"), Lookup::Written("x"));
        assert_eq!(state.deletes().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn deleted_directory_hides_everything_beneath_it() {
        let mut state = OverlayState::new();
        state.write("src/old/new.ts", "x");
        state.delete("src/old/gone.ts");
        state.delete("src/old");
        assert_eq!(state.lookup("src/old"), Lookup::Deleted);
        assert_eq!(state.lookup("src/old/a.ts"), Lookup::Deleted);
        assert_eq!(state.lookup("src/old/deep/b.ts"), Lookup::Deleted);
        assert_eq!(state.lookup("src/older.ts"), fallback("src/older.ts"));
        assert_eq!(state.writes().count(), 0);
        assert_eq!(state.deletes().collect::<Vec<_>>(), vec!["src/old"]);

        state.write("src/old/a.ts", "back");
        assert_eq!(state.lookup("src/old/a.ts"), Lookup::Written("back"));
        assert_eq!(state.lookup("src/old/b.ts"), Lookup::Deleted);
    }

    #[test]
    fn renamed_directory_serves_children_from_source() {
        let mut state = OverlayState::new();
        state.write("src/old/pending.ts", "p");
        state.delete("src/old/gone.ts");
        state.rename("src/old", "src/new");

        assert_eq!(state.lookup("src/old/a.ts"), Lookup::Deleted);
        assert_eq!(state.lookup("src/new"), fallback("src/old"));
        assert_eq!(
            state.lookup("src/new/deep/a.ts"),
            Lookup::Fallback(Cow::Owned("src/old/deep/a.ts".to_string()))
        );
        assert_eq!(state.lookup("src/new/pending.ts"), Lookup::Written("p"));
        assert_eq!(state.lookup("src/new/gone.ts"), Lookup::Deleted);
        assert!(state.has_writes_under("src/new"));
        assert!(!state.has_writes_under("src/old"));
    }

    #[test]
    fn chained_directory_renames_resolve_to_original_source() {
        let mut state = OverlayState::new();
        state.rename("a", "b");
        state.rename("b/c", "d");
        assert_eq!(state.lookup("d/x.ts"), fallback("a/c/x.ts"));
        assert_eq!(state.lookup("b/c/x.ts"), Lookup::Deleted);
        assert_eq!(state.lookup("b/y.ts"), fallback("a/y.ts"));
    }

    #[test]
    fn file_written_over_directory_hides_old_children() {
        let mut state = OverlayState::new();
        state.write("lib", "now a file");
        assert_eq!(state.lookup("lib"), Lookup::Written("now a file"));
        assert_eq!(state.lookup("lib/a.ts"), Lookup::Deleted);
    }

    #[test]
    fn rename_into_itself_is_ignored() {
        let mut state = OverlayState::new();
        state.rename("a", "a/b");
        state.rename("a", "a");
        assert!(state.is_empty());
    }

    #[test]
    fn untouched_paths_fall_back() {
        let state = OverlayState::new();
        assert!(state.is_empty());
        assert_eq!(state.lookup("x"), fallback("x"));
    }

    #[test]
    fn apply_order_groups_by_kind_and_keeps_relative_order() {
        let ops = vec![
            Operation::Write {
                path: "w1".to_string(),
                description: None,
                content: String::new(),
            },
            Operation::AddDependency {
                packages: vec!["p".to_string()],
            },
            Operation::Rename {
                from: "r1".to_string(),
                to: "r2".to_string(),
            },
            Operation::Delete {
                path: "d1".to_string(),
            },
            Operation::Write {
                path: "w2".to_string(),
                description: None,
                content: String::new(),
            },
            Operation::Delete {
                path: "d2".to_string(),
            },
        ];
        let order: Vec<Vec<&str>> = apply_order(&ops).iter().map(|op| op.paths()).collect();
        assert_eq!(
            order,
            vec![
                vec!["d1"],
                vec!["d2"],
                vec!["r1", "r2"],
                vec!["w1"],
                vec!["w2"]
            ]
        );
    }
}
