//! Tag grammar and attribute escaper.
//!
//! Model output may contain markup inside attribute values (for example a
//! description mentioning `<a>` tags). Left alone, those brackets would end a
//! tag's opening marker early and corrupt its span. [`escape`] replaces `<`/`>`
//! inside attribute values of recognized tags with fullwidth look-alikes and
//! leaves every other byte untouched, including tag content bodies.

use std::sync::LazyLock;

use regex::Regex;

/// Tag names that produce operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagName {
    Write,
    Rename,
    Delete,
    AddDependency,
    ExecuteSql,
}

impl TagName {
    pub const ALL: [TagName; 5] = [
        TagName::Write,
        TagName::Rename,
        TagName::Delete,
        TagName::AddDependency,
        TagName::ExecuteSql,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TagName::Write => "dyad-write",
            TagName::Rename => "dyad-rename",
            TagName::Delete => "dyad-delete",
            TagName::AddDependency => "dyad-add-dependency",
            TagName::ExecuteSql => "dyad-execute-sql",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == name)
    }

    pub fn closing_marker(self) -> String {
        format!("</{}>", self.as_str())
    }
}

pub const LESS_THAN_SUBSTITUTE: char = '\u{FF1C}';
pub const GREATER_THAN_SUBSTITUTE: char = '\u{FF1E}';

/// `|`-joined tag names for building alternation patterns.
pub(crate) fn tag_alternation() -> String {
    TagName::ALL
        .iter()
        .map(|tag| regex::escape(tag.as_str()))
        .collect::<Vec<_>>()
        .join("|")
}

// Quoted values may hold raw brackets; everything else stops at `<` or `>`.
static RAW_OPENING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"<(?:{})(?:\s(?:[^<>"]|"[^"]*")*)?>"#,
        tag_alternation()
    ))
    .unwrap()
});

static ATTRIBUTE_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"="([^"]*)""#).unwrap());

/// Maps offsets in escaped text back to offsets in the raw text.
///
/// Only offsets that fall outside an opening marker are meaningful; text
/// between markers is copied verbatim, so a single anchor per marker suffices.
#[derive(Debug, Clone, Default)]
pub(crate) struct OffsetMap {
    /// `(raw_end, escaped_end)` for every rewritten opening marker, ascending.
    anchors: Vec<(usize, usize)>,
}

impl OffsetMap {
    pub(crate) fn to_raw(&self, escaped: usize) -> usize {
        let idx = self
            .anchors
            .partition_point(|&(_, escaped_end)| escaped_end <= escaped);
        match idx.checked_sub(1).map(|i| self.anchors[i]) {
            Some((raw_end, escaped_end)) => raw_end + (escaped - escaped_end),
            None => escaped,
        }
    }
}

/// Replace `<`/`>` inside attribute values of recognized tags.
///
/// Idempotent: substitutes are never altered again.
pub fn escape(raw: &str) -> String {
    escape_mapped(raw).0
}

pub(crate) fn escape_mapped(raw: &str) -> (String, OffsetMap) {
    let mut out = String::with_capacity(raw.len());
    let mut map = OffsetMap::default();
    let mut last = 0;
    for marker in RAW_OPENING_RE.find_iter(raw) {
        out.push_str(&raw[last..marker.start()]);
        out.push_str(&escape_marker(marker.as_str()));
        last = marker.end();
        map.anchors.push((last, out.len()));
    }
    out.push_str(&raw[last..]);
    (out, map)
}

fn escape_marker(marker: &str) -> String {
    ATTRIBUTE_VALUE_RE
        .replace_all(marker, |caps: &regex::Captures<'_>| {
            let value: String = caps[1]
                .chars()
                .map(|c| match c {
                    '<' => LESS_THAN_SUBSTITUTE,
                    '>' => GREATER_THAN_SUBSTITUTE,
                    other => other,
                })
                .collect();
            format!("=\"{value}\"")
        })
        .into_owned()
}
