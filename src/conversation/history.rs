//! In-memory thread history: received messages and conversation turns.

use crate::{InboundMessage, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Default number of received messages and turns kept per thread.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// A message the gateway received, kept for quote resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    pub platform_message_id: String,
    pub sender: String,
    pub text: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl From<&InboundMessage> for ReceivedMessage {
    fn from(message: &InboundMessage) -> Self {
        Self {
            platform_message_id: message.id.clone(),
            sender: message.author().to_string(),
            text: message.content.to_string(),
            received_at: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation as the generation backend sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            content: content.into(),
        }
    }
}

#[derive(Debug, Default)]
struct ThreadLog {
    received: VecDeque<ReceivedMessage>,
    turns: VecDeque<Turn>,
}

/// Bounded per-thread history of received messages and turns.
#[derive(Debug)]
pub struct ThreadHistory {
    capacity: usize,
    threads: Mutex<HashMap<ThreadId, ThreadLog>>,
}

impl ThreadHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the received messages, oldest first.
    pub fn received(&self, thread_id: &ThreadId) -> Vec<ReceivedMessage> {
        self.threads
            .lock()
            .get(thread_id)
            .map(|log| log.received.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the conversation turns, oldest first.
    pub fn turns(&self, thread_id: &ThreadId) -> Vec<Turn> {
        self.threads
            .lock()
            .get(thread_id)
            .map(|log| log.turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Atomically snapshot history and append a flushed batch to it.
    ///
    /// Returns the received messages and turns as they were *before* the
    /// batch was added. The batch itself becomes one user turn.
    pub fn begin_batch(
        &self,
        thread_id: &ThreadId,
        batch: &[InboundMessage],
        user_turn: &str,
    ) -> (Vec<ReceivedMessage>, Vec<Turn>) {
        let mut threads = self.threads.lock();
        let log = threads.entry(thread_id.clone()).or_default();
        let received = log.received.iter().cloned().collect();
        let turns = log.turns.iter().cloned().collect();

        for message in batch {
            push_bounded(&mut log.received, ReceivedMessage::from(message), self.capacity);
        }
        push_bounded(&mut log.turns, Turn::user(user_turn), self.capacity);

        (received, turns)
    }

    pub fn push_turn(&self, thread_id: &ThreadId, turn: Turn) {
        let mut threads = self.threads.lock();
        let log = threads.entry(thread_id.clone()).or_default();
        push_bounded(&mut log.turns, turn, self.capacity);
    }
}

impl Default for ThreadHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    while queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::{ThreadHistory, Turn, TurnRole};
    use crate::{InboundMessage, ThreadId};

    #[test]
    fn begin_batch_returns_prior_state() {
        let history = ThreadHistory::new(10);
        let thread: ThreadId = "t".into();
        let first = vec![InboundMessage::text("t", "m1", "alice", "hi")];
        let second = vec![InboundMessage::text("t", "m2", "bob", "yo")];

        let (received, turns) = history.begin_batch(&thread, &first, "[0] alice: hi");
        assert!(received.is_empty());
        assert!(turns.is_empty());

        let (received, turns) = history.begin_batch(&thread, &second, "[0] bob: yo");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].platform_message_id, "m1");
        assert_eq!(turns, vec![Turn::user("[0] alice: hi")]);
        assert_eq!(history.received(&thread).len(), 2);
    }

    #[test]
    fn capacity_drops_oldest() {
        let history = ThreadHistory::new(2);
        let thread: ThreadId = "t".into();
        for n in 0..3 {
            history.push_turn(&thread, Turn::assistant(format!("reply {n}")));
        }

        let turns = history.turns(&thread);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "reply 1");
        assert_eq!(turns[1].role, TurnRole::Assistant);
    }
}
