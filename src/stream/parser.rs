//! Incremental stream parser with exactly-once dispatch.
//!
//! Every chunk is appended to the buffer and the *whole* buffer is rescanned.
//! Each completed tag produces a dispatch key (kind + normalized payload);
//! a key that was already dispatched is skipped, which is what makes
//! rescanning a growing buffer idempotent.
//!
//! The buffer belongs to one streaming attempt and is cleared by
//! [`StreamParser::begin_attempt`]. The dispatch keys belong to the whole
//! operation and survive retries, so an attempt that repeats text an earlier
//! failed attempt already delivered does not deliver it again.

use crate::stream::tags::{self, ReactionKind, TagMatch};
use crate::tools::ToolInvocation;

use std::collections::HashSet;

/// A side effect the dispatcher should perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAction {
    /// React to a batch message. `index: None` targets the newest one.
    Reaction {
        index: Option<i64>,
        kind: ReactionKind,
    },
    Sticker {
        keyword: String,
    },
    Message {
        text: String,
        quote: Option<i64>,
    },
    Undo {
        index: i64,
    },
    Tool(ToolInvocation),
}

impl StreamAction {
    /// Short label for logs and process events.
    pub fn label(&self) -> &'static str {
        match self {
            StreamAction::Reaction { .. } => "reaction",
            StreamAction::Sticker { .. } => "sticker",
            StreamAction::Message { quote: Some(_), .. } => "quote",
            StreamAction::Message { quote: None, .. } => "message",
            StreamAction::Undo { .. } => "undo",
            StreamAction::Tool(_) => "tool",
        }
    }
}

/// Keys of tag instances already dispatched, one set per action kind.
#[derive(Debug, Default, Clone)]
pub struct DispatchKeys {
    reaction: HashSet<String>,
    sticker: HashSet<String>,
    message: HashSet<String>,
    undo: HashSet<String>,
    tool: HashSet<String>,
}

impl DispatchKeys {
    pub fn len(&self) -> usize {
        self.reaction.len()
            + self.sticker.len()
            + self.message.len()
            + self.undo.len()
            + self.tool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserPhase {
    Streaming,
    Finished,
    Aborted,
}

/// Exactly-once tag dispatcher over a monotonically growing buffer.
#[derive(Debug)]
pub struct StreamParser {
    buffer: String,
    keys: DispatchKeys,
    phase: ParserPhase,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            keys: DispatchKeys::default(),
            phase: ParserPhase::Streaming,
        }
    }

    pub fn phase(&self) -> ParserPhase {
        self.phase
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Whether any action has been dispatched in this operation.
    pub fn has_dispatched(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Start a fresh attempt: clear the text buffer, keep dispatch keys.
    pub fn begin_attempt(&mut self) {
        self.buffer.clear();
        self.phase = ParserPhase::Streaming;
    }

    /// Append a chunk and return actions completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamAction> {
        if self.phase != ParserPhase::Streaming {
            return Vec::new();
        }
        self.buffer.push_str(chunk);
        self.scan()
    }

    /// End of stream: final scan, then the untagged remainder as a plain message.
    pub fn finish(&mut self) -> Vec<StreamAction> {
        if self.phase != ParserPhase::Streaming {
            return Vec::new();
        }
        let mut actions = self.scan();

        let remainder = tags::strip_tags(&self.buffer);
        let remainder = remainder.trim();
        if !remainder.is_empty() && self.keys.message.insert(format!("text:{remainder}")) {
            actions.push(StreamAction::Message {
                text: remainder.to_string(),
                quote: None,
            });
        }

        self.phase = ParserPhase::Finished;
        actions
    }

    /// Stop parsing after cancellation. Later chunks are ignored.
    pub fn abort(&mut self) {
        if self.phase == ParserPhase::Streaming {
            self.phase = ParserPhase::Aborted;
        }
    }

    fn scan(&mut self) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        for (_, tag) in tags::scan(&self.buffer) {
            if let Some(action) = self.admit(tag) {
                actions.push(action);
            }
        }
        actions
    }

    /// Turn a match into an action unless its key was already dispatched.
    fn admit(&mut self, tag: TagMatch) -> Option<StreamAction> {
        match tag {
            TagMatch::Reaction { index, name } => {
                let Some(kind) = ReactionKind::parse(&name) else {
                    tracing::debug!(%name, "ignoring unknown reaction");
                    return None;
                };
                let target = index.map_or_else(|| "_".to_string(), |index| index.to_string());
                self.keys
                    .reaction
                    .insert(format!("reaction:{target}:{kind}"))
                    .then_some(StreamAction::Reaction { index, kind })
            }
            TagMatch::Sticker { keyword } => self
                .keys
                .sticker
                .insert(format!("sticker:{keyword}"))
                .then_some(StreamAction::Sticker { keyword }),
            TagMatch::Quote { index, text } => {
                if text.is_empty() {
                    return None;
                }
                self.keys
                    .message
                    .insert(format!("quote:{index}:{text}"))
                    .then_some(StreamAction::Message {
                        text,
                        quote: Some(index),
                    })
            }
            TagMatch::Msg { text } => {
                if text.is_empty() {
                    return None;
                }
                self.keys
                    .message
                    .insert(format!("msg:{text}"))
                    .then_some(StreamAction::Message { text, quote: None })
            }
            TagMatch::Undo { index } => self
                .keys
                .undo
                .insert(format!("undo:{index}"))
                .then_some(StreamAction::Undo { index }),
            TagMatch::Tool { name, args, body } => self
                .keys
                .tool
                .insert(format!("tool:{name}:{args}:{body}"))
                .then_some(StreamAction::Tool(ToolInvocation { name, args, body })),
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}
