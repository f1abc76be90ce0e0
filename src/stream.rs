//! Streaming tag language: grammar and exactly-once parser.

pub mod parser;
pub mod tags;

pub use parser::{ParserPhase, StreamAction, StreamParser};
pub use tags::{ReactionKind, TagMatch, scan, strip_tags};
