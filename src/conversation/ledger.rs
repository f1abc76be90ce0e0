//! Sent-message ledger: bounded per-thread record of what the bot sent.
//!
//! Entries are appended in send order and evicted FIFO once the per-thread
//! capacity is reached. Lookups use negative relative indices counted from the
//! newest entry, so `-1` is the message the bot sent most recently.

use crate::ThreadId;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Default number of sent messages remembered per thread.
pub const DEFAULT_LEDGER_CAPACITY: usize = 20;

/// Metadata for one message the bot delivered to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessageRecord {
    pub platform_message_id: String,
    pub client_message_id: String,
    pub content: String,
    pub sent_at_epoch_ms: i64,
}

#[derive(Debug, Default)]
struct ThreadLedger {
    entries: VecDeque<SentMessageRecord>,
    next_sequence: u64,
}

/// Bounded per-thread store of sent-message metadata.
#[derive(Debug)]
pub struct SentMessageLedger {
    capacity: usize,
    threads: Mutex<HashMap<ThreadId, ThreadLedger>>,
}

impl SentMessageLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sent message, evicting the oldest entry when full.
    ///
    /// Returns the per-thread send sequence number of the new entry.
    pub fn record(
        &self,
        thread_id: &ThreadId,
        platform_message_id: impl Into<String>,
        client_message_id: impl Into<String>,
        content: impl Into<String>,
    ) -> u64 {
        let record = SentMessageRecord {
            platform_message_id: platform_message_id.into(),
            client_message_id: client_message_id.into(),
            content: content.into(),
            sent_at_epoch_ms: chrono::Utc::now().timestamp_millis(),
        };

        let mut threads = self.threads.lock();
        let ledger = threads.entry(thread_id.clone()).or_default();
        while ledger.entries.len() >= self.capacity {
            if let Some(evicted) = ledger.entries.pop_front() {
                tracing::trace!(
                    thread_id = %thread_id,
                    platform_message_id = %evicted.platform_message_id,
                    "evicted sent message from ledger"
                );
            }
        }
        ledger.entries.push_back(record);

        let sequence = ledger.next_sequence;
        ledger.next_sequence += 1;
        sequence
    }

    /// Resolve a negative relative index (`-1` = newest).
    ///
    /// Non-negative indices never address the ledger and always return `None`.
    pub fn resolve(&self, thread_id: &ThreadId, index: i64) -> Option<SentMessageRecord> {
        if index >= 0 {
            return None;
        }
        let back = usize::try_from(index.unsigned_abs()).ok()?;

        let threads = self.threads.lock();
        let ledger = threads.get(thread_id)?;
        let position = ledger.entries.len().checked_sub(back)?;
        ledger.entries.get(position).cloned()
    }

    /// Remove a record by platform id (after an undo). Returns the removed record.
    pub fn remove(
        &self,
        thread_id: &ThreadId,
        platform_message_id: &str,
    ) -> Option<SentMessageRecord> {
        let mut threads = self.threads.lock();
        let ledger = threads.get_mut(thread_id)?;
        let position = ledger
            .entries
            .iter()
            .position(|record| record.platform_message_id == platform_message_id)?;
        ledger.entries.remove(position)
    }

    pub fn len(&self, thread_id: &ThreadId) -> usize {
        self.threads
            .lock()
            .get(thread_id)
            .map(|ledger| ledger.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, thread_id: &ThreadId) -> bool {
        self.len(thread_id) == 0
    }
}

impl Default for SentMessageLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::SentMessageLedger;
    use crate::ThreadId;

    fn thread(name: &str) -> ThreadId {
        ThreadId::from(name)
    }

    #[test]
    fn resolves_newest_first() {
        let ledger = SentMessageLedger::new(20);
        let t = thread("t1");
        ledger.record(&t, "p1", "c1", "first");
        ledger.record(&t, "p2", "c2", "second");
        ledger.record(&t, "p3", "c3", "third");

        let contents: Vec<String> = [-1, -2, -3]
            .iter()
            .map(|index| ledger.resolve(&t, *index).expect("entry exists").content)
            .collect();
        assert_eq!(contents, vec!["third", "second", "first"]);
        assert!(ledger.resolve(&t, -4).is_none());
    }

    #[test]
    fn non_negative_index_is_not_a_ledger_index() {
        let ledger = SentMessageLedger::new(20);
        let t = thread("t1");
        ledger.record(&t, "p1", "c1", "first");

        assert!(ledger.resolve(&t, 0).is_none());
        assert!(ledger.resolve(&t, 1).is_none());
    }

    #[test]
    fn evicted_entry_is_unresolvable() {
        let ledger = SentMessageLedger::new(3);
        let t = thread("t1");
        for n in 1..=4 {
            ledger.record(&t, format!("p{n}"), format!("c{n}"), format!("m{n}"));
        }

        assert_eq!(ledger.len(&t), 3);
        let reachable: Vec<String> = (1..=10)
            .filter_map(|back| ledger.resolve(&t, -back))
            .map(|record| record.platform_message_id)
            .collect();
        assert_eq!(reachable, vec!["p4", "p3", "p2"]);
        assert!(!reachable.contains(&"p1".to_string()));
    }

    #[test]
    fn sequence_numbers_keep_growing_past_eviction() {
        let ledger = SentMessageLedger::new(2);
        let t = thread("t1");
        let sequences: Vec<u64> = (0..4)
            .map(|n| ledger.record(&t, format!("p{n}"), "c", "x"))
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }

    #[test]
    fn remove_shifts_relative_indices() {
        let ledger = SentMessageLedger::new(20);
        let t = thread("t1");
        ledger.record(&t, "p1", "c1", "first");
        ledger.record(&t, "p2", "c2", "second");

        let removed = ledger.remove(&t, "p2").expect("p2 recorded");
        assert_eq!(removed.content, "second");
        assert_eq!(ledger.resolve(&t, -1).map(|r| r.content).as_deref(), Some("first"));
        assert!(ledger.remove(&t, "p2").is_none());
    }

    #[test]
    fn threads_are_isolated() {
        let ledger = SentMessageLedger::new(20);
        ledger.record(&thread("a"), "pa", "ca", "for a");

        assert!(ledger.resolve(&thread("b"), -1).is_none());
        assert!(ledger.is_empty(&thread("b")));
    }
}
