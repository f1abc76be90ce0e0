//! murmur: a chat gateway that turns a streaming tag language into chat actions.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod logging;
pub mod messaging;
pub mod stream;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Conversation thread identifier. The unit of isolation for buffering,
/// cancellation, history and the sent-message ledger.
pub type ThreadId = Arc<str>;

/// Inbound message from a chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id, used as a reaction/quote target.
    pub id: String,
    pub thread_id: ThreadId,
    pub sender_id: String,
    /// Display name for prompt attribution. Falls back to `sender_id`.
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl InboundMessage {
    /// Build a plain-text message stamped with the current time.
    pub fn text(
        thread_id: impl Into<ThreadId>,
        id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            content: MessageContent::Text(text.into()),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn author(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender_id)
    }
}

/// Message content variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    /// A sticker sent by the user, carried as its keyword/description.
    Sticker(String),
}

impl std::fmt::Display for MessageContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageContent::Text(text) => write!(f, "{}", text),
            MessageContent::Sticker(keyword) => write!(f, "[sticker: {}]", keyword),
        }
    }
}

/// Lifecycle events broadcast by the scheduler and dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    BatchFlushed {
        thread_id: ThreadId,
        generation: u64,
        message_count: usize,
    },
    GenerationStarted {
        thread_id: ThreadId,
        generation: u64,
    },
    GenerationCompleted {
        thread_id: ThreadId,
        generation: u64,
    },
    GenerationCancelled {
        thread_id: ThreadId,
        generation: u64,
    },
    GenerationFailed {
        thread_id: ThreadId,
        generation: u64,
        error: String,
    },
    ActionDispatched {
        thread_id: ThreadId,
        action: String,
    },
}

/// Shared dependency bundle for the scheduler and its generation tasks.
#[derive(Clone)]
pub struct GatewayDeps {
    pub pool: Arc<llm::RotationPool>,
    pub backend: Arc<dyn llm::GenerationBackend>,
    pub transport: Arc<dyn messaging::MessagingDyn>,
    pub tools: Option<Arc<dyn tools::ToolExecutor>>,
    pub ledger: Arc<conversation::SentMessageLedger>,
    pub history: Arc<conversation::ThreadHistory>,
    pub runtime_config: Arc<config::RuntimeConfig>,
    pub event_tx: tokio::sync::broadcast::Sender<ProcessEvent>,
}

impl GatewayDeps {
    /// Publish a lifecycle event. Having no subscribers is not an error.
    pub fn emit(&self, event: ProcessEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for GatewayDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayDeps")
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}
