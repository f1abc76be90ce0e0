//! Tag syntax: recognition and stripping of the inline action language.
//!
//! | Tag | Form |
//! |-----|------|
//! | reaction | `[reaction:NAME]` or `[reaction:INDEX:NAME]` |
//! | sticker | `[sticker:KEYWORD]` |
//! | quote | `[quote:INDEX]TEXT[/quote]` |
//! | msg | `[msg]TEXT[/msg]` |
//! | undo | `[undo:INDEX]` |
//! | tool | `[tool:NAME ARGS]BODY[/tool]` |

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::LazyLock;

static REACTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[reaction:(?:(-?\d+):)?([A-Za-z_]+)\]").expect("hardcoded reaction regex")
});

static STICKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[sticker:([^\]\[]+)\]").expect("hardcoded sticker regex"));

static QUOTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[quote:(-?\d+)\](.*?)\[/quote\]").expect("hardcoded quote regex")
});

static MSG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[msg\](.*?)\[/msg\]").expect("hardcoded msg regex"));

static UNDO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[undo:(-?\d+)\]").expect("hardcoded undo regex"));

static TOOL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[tool:([^\]\s]+)([^\]]*)\](.*?)\[/tool\]").expect("hardcoded tool regex")
});

static TOOL_OPEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[tool:[^\]]*\]").expect("hardcoded tool open regex"));

static UNTERMINATED_SPAN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[(?:quote:-?\d+|msg|tool:[^\]]*)\].*$").expect("hardcoded span regex")
});

static STRAY_CLOSE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[/(?:quote|msg|tool)\]").expect("hardcoded close regex"));

/// Tag names, used to recognise a partial tag cut off at the end of the buffer.
const TAG_NAMES: &[&str] = &["reaction", "sticker", "quote", "msg", "undo", "tool"];

/// The reaction vocabulary. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Heart,
    Laugh,
    Wow,
    Sad,
    Angry,
    Like,
}

impl ReactionKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "heart" => Some(Self::Heart),
            "laugh" => Some(Self::Laugh),
            "wow" => Some(Self::Wow),
            "sad" => Some(Self::Sad),
            "angry" => Some(Self::Angry),
            "like" => Some(Self::Like),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heart => "heart",
            Self::Laugh => "laugh",
            Self::Wow => "wow",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Like => "like",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Heart => "❤️",
            Self::Laugh => "😆",
            Self::Wow => "😮",
            Self::Sad => "😢",
            Self::Angry => "😠",
            Self::Like => "👍",
        }
    }
}

impl std::fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed tag found in the buffer, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagMatch {
    Reaction { index: Option<i64>, name: String },
    Sticker { keyword: String },
    Quote { index: i64, text: String },
    Msg { text: String },
    Undo { index: i64 },
    Tool { name: String, args: String, body: String },
}

/// Find every completed tag in `buffer`, ordered by position.
///
/// Inline tags inside a tool span (closed or still open) are skipped: tool
/// bodies are opaque.
pub fn scan(buffer: &str) -> Vec<(usize, TagMatch)> {
    let tool_spans = tool_spans(buffer);
    let inside_tool =
        |start: usize| tool_spans.iter().any(|span| span.start < start && start < span.end);

    let mut matches = Vec::new();

    for captures in TOOL_REGEX.captures_iter(buffer) {
        let (Some(whole), Some(name), Some(args), Some(body)) =
            (captures.get(0), captures.get(1), captures.get(2), captures.get(3))
        else {
            continue;
        };
        matches.push((
            whole.start(),
            TagMatch::Tool {
                name: name.as_str().to_string(),
                args: args.as_str().trim().to_string(),
                body: body.as_str().trim().to_string(),
            },
        ));
    }

    for captures in REACTION_REGEX.captures_iter(buffer) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(2)) else {
            continue;
        };
        if inside_tool(whole.start()) {
            continue;
        }
        let index = match captures.get(1) {
            Some(raw) => match raw.as_str().parse::<i64>() {
                Ok(index) => Some(index),
                Err(_) => continue,
            },
            None => None,
        };
        matches.push((
            whole.start(),
            TagMatch::Reaction {
                index,
                name: name.as_str().to_string(),
            },
        ));
    }

    for captures in STICKER_REGEX.captures_iter(buffer) {
        let (Some(whole), Some(keyword)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if inside_tool(whole.start()) {
            continue;
        }
        let keyword = keyword.as_str().trim();
        if keyword.is_empty() {
            continue;
        }
        matches.push((
            whole.start(),
            TagMatch::Sticker {
                keyword: keyword.to_string(),
            },
        ));
    }

    for captures in QUOTE_REGEX.captures_iter(buffer) {
        let (Some(whole), Some(index), Some(text)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        if inside_tool(whole.start()) {
            continue;
        }
        let Ok(index) = index.as_str().parse::<i64>() else {
            continue;
        };
        matches.push((
            whole.start(),
            TagMatch::Quote {
                index,
                text: clean_body(text.as_str()),
            },
        ));
    }

    for captures in MSG_REGEX.captures_iter(buffer) {
        let (Some(whole), Some(text)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if inside_tool(whole.start()) {
            continue;
        }
        matches.push((
            whole.start(),
            TagMatch::Msg {
                text: clean_body(text.as_str()),
            },
        ));
    }

    for captures in UNDO_REGEX.captures_iter(buffer) {
        let (Some(whole), Some(index)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if inside_tool(whole.start()) {
            continue;
        }
        let Ok(index) = index.as_str().parse::<i64>() else {
            continue;
        };
        matches.push((whole.start(), TagMatch::Undo { index }));
    }

    matches.sort_by_key(|(start, _)| *start);
    matches
}

/// Remove every recognised tag from `buffer`, including spans that were
/// opened but never closed and a partial tag cut off at the very end.
pub fn strip_tags(buffer: &str) -> String {
    let mut text = TOOL_REGEX.replace_all(buffer, "").into_owned();
    text = QUOTE_REGEX.replace_all(&text, "").into_owned();
    text = MSG_REGEX.replace_all(&text, "").into_owned();
    text = strip_inline(&text);
    text = UNTERMINATED_SPAN_REGEX.replace(&text, "").into_owned();
    text = STRAY_CLOSE_REGEX.replace_all(&text, "").into_owned();
    strip_partial_suffix(&text).to_string()
}

/// Remove single-token tags (reaction, sticker, undo).
fn strip_inline(text: &str) -> String {
    let text = REACTION_REGEX.replace_all(text, "");
    let text = STICKER_REGEX.replace_all(&text, "");
    UNDO_REGEX.replace_all(&text, "").into_owned()
}

/// Message bodies drop inline tags (they dispatch on their own) and
/// surrounding whitespace.
fn clean_body(body: &str) -> String {
    strip_inline(body).trim().to_string()
}

fn tool_spans(buffer: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = TOOL_REGEX
        .find_iter(buffer)
        .map(|found| found.range())
        .collect();

    // An opened tool span that has not closed yet runs to the end of the buffer.
    let open = TOOL_OPEN_REGEX
        .find_iter(buffer)
        .find(|found| !spans.iter().any(|span| span.contains(&found.start())));
    if let Some(found) = open {
        spans.push(found.start()..buffer.len());
    }
    spans
}

/// Drop a trailing `[name…` fragment that could still grow into a tag.
fn strip_partial_suffix(text: &str) -> &str {
    let Some(open) = text.rfind('[') else {
        return text;
    };
    let tail = &text[open + 1..];
    if tail.contains(']') {
        return text;
    }

    let tail = tail.strip_prefix('/').unwrap_or(tail);
    let (name, rest) = match tail.split_once(':') {
        Some((name, rest)) => (name, Some(rest)),
        None => (tail, None),
    };
    let looks_like_tag = match rest {
        // `[reac` could still become `[reaction:…]`
        None => TAG_NAMES.iter().any(|tag| tag.starts_with(name)),
        Some(rest) => {
            name == "tool" || (TAG_NAMES.contains(&name) && !rest.contains(char::is_whitespace))
        }
    };

    if looks_like_tag { &text[..open] } else { text }
}
