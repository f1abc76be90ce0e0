//! Per-thread conversation state: received history, turns, and the sent-message ledger.

pub mod history;
pub mod ledger;
pub mod reference;

pub use history::{ReceivedMessage, ThreadHistory, Turn, TurnRole};
pub use ledger::{SentMessageLedger, SentMessageRecord};
pub use reference::{MessageReference, resolve_reference};
