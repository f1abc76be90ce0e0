//! Signed-index resolution for quote, reaction and undo targets.
//!
//! One numbering space covers three stores:
//!
//! - `index < 0` counts back through the sent-message ledger (`-1` = newest).
//! - `0 <= index < batch.len()` addresses the batch being answered, oldest first.
//! - `index >= batch.len()` falls back to the received history that preceded
//!   the batch, counted back from its newest entry.

use crate::ThreadId;
use crate::conversation::{ReceivedMessage, SentMessageLedger, SentMessageRecord};

/// A message that a tag index resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageReference {
    /// A message from the batch currently being answered.
    Batch(ReceivedMessage),
    /// An older received message from thread history.
    History(ReceivedMessage),
    /// A message the bot sent earlier.
    Sent(SentMessageRecord),
}

impl MessageReference {
    pub fn platform_message_id(&self) -> &str {
        match self {
            MessageReference::Batch(message) | MessageReference::History(message) => {
                &message.platform_message_id
            }
            MessageReference::Sent(record) => &record.platform_message_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, MessageReference::Sent(_))
    }
}

/// Resolve a signed tag index. Returns `None` when nothing lives at `index`.
pub fn resolve_reference(
    thread_id: &ThreadId,
    index: i64,
    batch: &[ReceivedMessage],
    prior_history: &[ReceivedMessage],
    ledger: &SentMessageLedger,
) -> Option<MessageReference> {
    if index < 0 {
        return ledger.resolve(thread_id, index).map(MessageReference::Sent);
    }

    let index = usize::try_from(index).ok()?;
    if let Some(message) = batch.get(index) {
        return Some(MessageReference::Batch(message.clone()));
    }

    let back = index - batch.len();
    let position = prior_history.len().checked_sub(back + 1)?;
    prior_history
        .get(position)
        .cloned()
        .map(MessageReference::History)
}
