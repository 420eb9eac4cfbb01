//! Streaming tag parser.
//!
//! Extracts typed [`Operation`]s from normalized (escaped) response text that
//! may still be arriving. Tags whose closing marker has not been received yet
//! are reported with `in_progress = true` so a consumer can render an in-flight
//! indicator; no closing marker is ever appended to the text itself.
//!
//! [`StreamParser`] keeps a cursor behind the last completed tag and only
//! rescans the unconsumed suffix on each chunk.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::escape::{TagName, escape, escape_mapped, tag_alternation};
use crate::core::types::{Operation, ParsedResponse, Segment, TagSpan};

static OPENING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"<({})((?:\s[^>]*)?)>", tag_alternation())).unwrap()
});

static WRITE_OPENING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<dyad-write(?:\s[^>]*)?>").unwrap());

static ATTRIBUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).unwrap());

static CHAT_SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<dyad-chat-summary>(.*?)</dyad-chat-summary>").unwrap());

static ANY_DYAD_OPENING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(dyad-[\w-]+)(?:\s[^>]*)?>").unwrap());

/// Parse a complete snapshot of normalized text.
pub fn parse(text: &str) -> ParsedResponse {
    ParsedResponse {
        segments: scan(text, 0, true).segments,
    }
}

/// Escape raw model output, then parse it.
pub fn parse_raw(raw: &str) -> ParsedResponse {
    parse(&escape(raw))
}

/// Incremental parser over a growing response buffer.
#[derive(Debug, Default, Clone)]
pub struct StreamParser {
    raw: String,
    raw_cursor: usize,
    normalized_prefix: String,
    committed: Vec<Segment>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and commit every tag completed so far.
    pub fn push(&mut self, chunk: &str) {
        self.raw.push_str(chunk);
        // A tag can only complete on a chunk carrying the closing '>'.
        if !chunk.contains('>') {
            return;
        }
        let (tail, map) = escape_mapped(&self.raw[self.raw_cursor..]);
        let scanned = scan(&tail, self.normalized_prefix.len(), false);
        if scanned.consumed == 0 {
            return;
        }
        debug!(
            committed = scanned.segments.len(),
            consumed = scanned.consumed,
            "committed completed tags"
        );
        self.committed.extend(scanned.segments);
        self.normalized_prefix.push_str(&tail[..scanned.consumed]);
        self.raw_cursor += map.to_raw(scanned.consumed);
    }

    /// Everything received so far, exactly as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Everything received so far, escaped.
    pub fn normalized(&self) -> String {
        let mut out = self.normalized_prefix.clone();
        out.push_str(&escape(&self.raw[self.raw_cursor..]));
        out
    }

    /// Operations and text so far, with unclosed tags marked in progress.
    pub fn snapshot(&self) -> ParsedResponse {
        let tail = escape(&self.raw[self.raw_cursor..]);
        let scanned = scan(&tail, self.normalized_prefix.len(), true);
        let mut segments = self.committed.clone();
        segments.extend(scanned.segments);
        ParsedResponse { segments }
    }

    /// True when the last write tag in the response never closed.
    pub fn is_truncated(&self) -> bool {
        has_unclosed_write(&self.normalized())
    }
}

struct Scan {
    segments: Vec<Segment>,
    /// Bytes of the scanned text that will never need rescanning.
    consumed: usize,
}

/// Scan `text` left to right for tags. `base` offsets spans into the full text.
///
/// Without `finalize` the scan stops at the first tag lacking a closing marker
/// and only reports what precedes it. With `finalize` such a tag becomes an
/// in-progress operation if it is one of the excess openings of its tag name,
/// and is left as plain text otherwise.
fn scan(text: &str, base: usize, finalize: bool) -> Scan {
    let synthesizable = if finalize {
        synthesizable_openings(text)
    } else {
        HashSet::new()
    };
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut search_from = 0;
    let mut consumed = 0;

    while let Some(caps) = OPENING_RE.captures_at(text, search_from) {
        let Some(open) = caps.get(0) else { break };
        let Some(tag) = TagName::from_name(&caps[1]) else {
            search_from = open.end();
            continue;
        };
        let attrs = caps.get(2).map_or("", |m| m.as_str());
        let closing = tag.closing_marker();

        match text[open.end()..].find(&closing) {
            Some(rel) => {
                let content_end = open.end() + rel;
                let end = content_end + closing.len();
                push_text(&mut segments, &text[text_start..open.start()]);
                let span = TagSpan {
                    start: base + open.start(),
                    end: base + end,
                    in_progress: false,
                };
                if let Some(operation) =
                    build_operation(tag, attrs, &text[open.end()..content_end], true)
                {
                    segments.push(Segment::Operation { operation, span });
                }
                text_start = end;
                search_from = end;
                consumed = end;
            }
            None if !finalize => break,
            None if synthesizable.contains(&open.start()) => {
                push_text(&mut segments, &text[text_start..open.start()]);
                let span = TagSpan {
                    start: base + open.start(),
                    end: base + text.len(),
                    in_progress: true,
                };
                if let Some(operation) = build_operation(tag, attrs, &text[open.end()..], false) {
                    segments.push(Segment::Operation { operation, span });
                }
                text_start = text.len();
                break;
            }
            None => {
                debug!(tag = tag.as_str(), at = base + open.start(), "dropping unmatched opening");
                search_from = open.end();
            }
        }
    }

    if finalize {
        push_text(&mut segments, &text[text_start..]);
        consumed = text.len();
    }
    Scan { segments, consumed }
}

/// Start offsets of openings that would receive a synthesized closing marker:
/// per tag name, the last `opens - closes` openings.
fn synthesizable_openings(text: &str) -> HashSet<usize> {
    let mut opens: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for caps in OPENING_RE.captures_iter(text) {
        if let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) {
            opens.entry(name.as_str()).or_default().push(whole.start());
        }
    }
    let mut eligible = HashSet::new();
    for (name, starts) in opens {
        let closes = text.matches(&format!("</{name}>")).count();
        let excess = starts.len().saturating_sub(closes);
        eligible.extend(starts[starts.len() - excess..].iter().copied());
    }
    eligible
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.is_empty() {
        segments.push(Segment::Text {
            text: text.to_string(),
        });
    }
}

fn build_operation(tag: TagName, attrs: &str, content: &str, closed: bool) -> Option<Operation> {
    let mut attributes = parse_attributes(attrs);
    let mut required = |key: &str| {
        let value = attributes.remove(key).filter(|v| !v.trim().is_empty());
        if value.is_none() {
            warn!(tag = tag.as_str(), attribute = key, "dropping tag without required attribute");
        }
        value
    };
    let operation = match tag {
        TagName::Write => Operation::Write {
            path: required("path")?,
            description: attributes.remove("description"),
            content: clean_write_content(content, closed),
        },
        TagName::Rename => {
            let from = required("from")?;
            let to = required("to")?;
            Operation::Rename { from, to }
        }
        TagName::Delete => Operation::Delete {
            path: required("path")?,
        },
        TagName::AddDependency => Operation::AddDependency {
            packages: split_packages(&required("packages")?),
        },
        TagName::ExecuteSql => Operation::ExecuteSql {
            content: content.trim().to_string(),
            description: attributes.remove("description"),
        },
    };
    Some(operation)
}

/// Permissive `key="value"` parsing; the first occurrence of a key wins.
pub fn parse_attributes(attrs: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for caps in ATTRIBUTE_RE.captures_iter(attrs) {
        out.entry(caps[1].to_string())
            .or_insert_with(|| caps[2].to_string());
    }
    out
}

fn split_packages(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split_whitespace()
        .filter(|pkg| seen.insert(*pkg))
        .map(str::to_string)
        .collect()
}

/// Trim a write body and drop a wrapping fence line at either end.
///
/// The trailing fence is only considered once the closing marker arrived.
pub fn clean_write_content(content: &str, closed: bool) -> String {
    let mut body = content.trim();
    if body.starts_with("```") {
        body = body.find('\n').map_or("", |idx| &body[idx + 1..]);
    }
    if closed
        && let Some(stripped) = body.trim_end().strip_suffix("```")
        && (stripped.is_empty() || stripped.ends_with('\n'))
    {
        body = stripped;
    }
    body.trim().to_string()
}

/// True when the *last* write opening has no closing marker after it.
///
/// This is the finished-response truncation check, distinct from in-progress
/// tagging during streaming.
pub fn has_unclosed_write(text: &str) -> bool {
    let Some(last) = WRITE_OPENING_RE.find_iter(text).last() else {
        return false;
    };
    !text[last.end()..].contains(&TagName::Write.closing_marker())
}

/// Text of the first `<dyad-chat-summary>` tag, if any.
pub fn chat_summary(text: &str) -> Option<String> {
    CHAT_SUMMARY_RE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|summary| !summary.is_empty())
}

/// Remove every complete `<dyad-*>…</dyad-*>` block and trim the result.
///
/// Unclosed and self-closing markup is left as is.
pub fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut search_from = 0;
    while let Some(caps) = ANY_DYAD_OPENING_RE.captures_at(text, search_from) {
        let Some(open) = caps.get(0) else { break };
        let closing = format!("</{}>", &caps[1]);
        match text[open.end()..].find(&closing) {
            Some(rel) => {
                out.push_str(&text[last..open.start()]);
                last = open.end() + rel + closing.len();
                search_from = last;
            }
            None => search_from = open.end(),
        }
    }
    out.push_str(&text[last..]);
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &str, description: Option<&str>, content: &str) -> Operation {
        Operation::Write {
            path: path.to_string(),
            description: description.map(str::to_string),
            content: content.to_string(),
        }
    }

    #[test]
    fn parses_operations_in_document_order() {
        let text = r#"Intro
<dyad-delete path="old/x.ts"></dyad-delete>
<dyad-rename from="a/b.ts" to="a/c.ts"></dyad-rename>
<dyad-write path="a/c.ts" description="rewrite">export const c = 1;</dyad-write>
<dyad-add-dependency packages="uuid zod uuid"></dyad-add-dependency>
<dyad-execute-sql description="users">CREATE TABLE users (id int);</dyad-execute-sql>
Outro"#;
        let parsed = parse_raw(text);
        let ops = parsed.completed_operations();
        assert_eq!(
            ops,
            vec![
                Operation::Delete {
                    path: "old/x.ts".to_string()
                },
                Operation::Rename {
                    from: "a/b.ts".to_string(),
                    to: "a/c.ts".to_string()
                },
                write("a/c.ts", Some("rewrite"), "export const c = 1;"),
                Operation::AddDependency {
                    packages: vec!["uuid".to_string(), "zod".to_string()]
                },
                Operation::ExecuteSql {
                    content: "CREATE TABLE users (id int);".to_string(),
                    description: Some("users".to_string())
                },
            ]
        );
        assert_eq!(
            parsed.segments.first(),
            Some(&Segment::Text {
                text: "Intro\n".to_string()
            })
        );
        assert_eq!(
            parsed.segments.last(),
            Some(&Segment::Text {
                text: "\nOutro".to_string()
            })
        );
    }

    #[test]
    fn strips_fenced_code_block_from_write() {
        let text = "<dyad-write path=\"src/components/TodoItem.tsx\" description=\"Creating a component\">\n```tsx\nimport React from \"react\";\nconsole.log(\"TodoItem\");\n```\n</dyad-write>\n";
        let ops = parse_raw(text).completed_operations();
        assert_eq!(
            ops,
            vec![write(
                "src/components/TodoItem.tsx",
                Some("Creating a component"),
                "import React from \"react\";\nconsole.log(\"TodoItem\");"
            )]
        );
    }

    #[test]
    fn missing_description_is_absent() {
        let text = "  <dyad-write path=\"src/pages/Highlands.tsx\">\nimport React from 'react';\n</dyad-write>\n";
        let ops = parse_raw(text).completed_operations();
        assert_eq!(ops, vec![write("src/pages/Highlands.tsx", None, "import React from 'react';")]);
    }

    #[test]
    fn description_markup_is_escaped_but_path_and_content_are_not() {
        let ops = parse_raw(r#"<dyad-write path="f" description="uses <a> tags">body</dyad-write>"#)
            .completed_operations();
        let [Operation::Write { path, description, content }] = ops.as_slice() else {
            panic!("expected a single write, got {ops:?}");
        };
        let description = description.as_deref().expect("description");
        assert!(!description.contains('<') && !description.contains('>'));
        assert_eq!(description, "uses ＜a＞ tags");
        assert_eq!(path, "f");
        assert_eq!(content, "body");
    }

    #[test]
    fn content_markup_is_preserved_verbatim() {
        let text = "<dyad-write path=\"App.tsx\">const x = <div className=\"a\">hi</div>;</dyad-write>";
        let ops = parse_raw(text).completed_operations();
        assert_eq!(
            ops,
            vec![write("App.tsx", None, "const x = <div className=\"a\">hi</div>;")]
        );
    }

    #[test]
    fn unclosed_write_is_in_progress() {
        let parsed = parse_raw("Working on it\n<dyad-write path=\"f\">partial");
        assert!(parsed.completed_operations().is_empty());
        let tagged: Vec<_> = parsed.tagged().collect();
        assert_eq!(tagged.len(), 1);
        let (op, span) = tagged[0];
        assert!(span.in_progress);
        assert_eq!(span.end, "Working on it\n<dyad-write path=\"f\">partial".len());
        assert_eq!(op, &write("f", None, "partial"));
    }

    #[test]
    fn in_progress_write_keeps_body_after_opening_fence() {
        let parsed = parse_raw("<dyad-write path=\"f.ts\">\n```ts\nconst a = 1;\n");
        assert_eq!(parsed.in_progress(), vec![&write("f.ts", None, "const a = 1;")]);
    }

    #[test]
    fn opening_without_excess_accounting_is_dropped() {
        let text = "stray </dyad-write> then <dyad-write path=\"f\">never closed";
        let parsed = parse_raw(text);
        assert_eq!(parsed.tagged().count(), 0);
        assert_eq!(
            parsed.segments,
            vec![Segment::Text {
                text: text.to_string()
            }]
        );
    }

    #[test]
    fn tags_missing_required_attributes_produce_nothing() {
        let parsed = parse_raw("<dyad-rename from=\"a\"></dyad-rename><dyad-delete></dyad-delete>");
        assert_eq!(parsed.tagged().count(), 0);
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let ops = parse_raw(r#"<dyad-write path="a.ts" version="2" description="d">x</dyad-write>"#)
            .completed_operations();
        assert_eq!(ops, vec![write("a.ts", Some("d"), "x")]);
    }

    #[test]
    fn streaming_chunks_match_full_parse() {
        let text = "Plan:\n<dyad-write path=\"src/a.tsx\" description=\"uses <b> tags\">\n```tsx\nexport const A = () => <b>a</b>;\n```\n</dyad-write>\nThen\n<dyad-rename from=\"x.ts\" to=\"y.ts\"></dyad-rename><dyad-add-dependency packages=\"react-router-dom\"></dyad-add-dependency>\n<dyad-write path=\"src/b.ts\">export const b = 2;";
        let mut parser = StreamParser::new();
        for (idx, ch) in text.char_indices() {
            parser.push(&text[idx..idx + ch.len_utf8()]);
        }
        assert_eq!(parser.raw(), text);
        assert_eq!(parser.normalized(), escape(text));
        assert_eq!(parser.snapshot(), parse_raw(text));
    }

    #[test]
    fn stream_marks_in_progress_until_closing_arrives() {
        let mut parser = StreamParser::new();
        parser.push("<dyad-write path=\"f\">partial");
        let mid = parser.snapshot();
        assert!(mid.has_in_progress());
        assert!(mid.completed_operations().is_empty());

        parser.push(" body</dyad-write> done");
        let done = parser.snapshot();
        assert!(!done.has_in_progress());
        assert_eq!(done.completed_operations(), vec![write("f", None, "partial body")]);
    }

    #[test]
    fn truncation_check_looks_at_last_write_only() {
        assert!(!has_unclosed_write("just text"));
        assert!(!has_unclosed_write("<dyad-write path=\"a\">x</dyad-write>"));
        assert!(has_unclosed_write("<dyad-write path=\"a\" description=\"d\">x"));
        assert!(has_unclosed_write(
            "<dyad-write path=\"a\">x</dyad-write>\ntext\n<dyad-write path=\"b\">y"
        ));
        assert!(!has_unclosed_write(
            "<dyad-write path=\"a\">x\ntext\n<dyad-write path=\"b\">y</dyad-write>"
        ));
    }

    #[test]
    fn mid_stream_unclosed_write_is_in_progress_and_truncated_when_final() {
        let text = "<dyad-write path=\"f\">partial";
        let mut parser = StreamParser::new();
        parser.push(text);
        assert!(parser.snapshot().has_in_progress());
        assert!(parser.is_truncated());
    }

    #[test]
    fn extracts_chat_summary() {
        let text = "<dyad-chat-summary> Renaming profile file </dyad-chat-summary> more";
        assert_eq!(chat_summary(text), Some("Renaming profile file".to_string()));
        assert_eq!(chat_summary("<dyad-chat-summary></dyad-chat-summary>"), None);
    }

    #[test]
    fn strip_tags_removes_complete_blocks_only() {
        assert_eq!(strip_tags(""), "");
        assert_eq!(
            strip_tags("Before text <dyad-write path=\"src/file.js\">console.log('hello');</dyad-write> After text"),
            "Before text  After text"
        );
        assert_eq!(
            strip_tags("<dyad-write path=\"a.js\">code1</dyad-write> between <dyad-custom-action p=\"v\">x</dyad-custom-action>"),
            "between"
        );
        assert_eq!(
            strip_tags("Before <dyad-delete path=\"file.js\" /> After"),
            "Before <dyad-delete path=\"file.js\" /> After"
        );
        assert_eq!(
            strip_tags("Before <dyad-write path=\"file.js\">unclosed tag After"),
            "Before <dyad-write path=\"file.js\">unclosed tag After"
        );
    }
}
