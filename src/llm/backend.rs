//! Generation backend seam: opens one streaming completion attempt.

use crate::ThreadId;
use crate::conversation::Turn;
use crate::error::GenerationError;
use crate::llm::pool::PoolEntry;

use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Incremental text fragments of one attempt. Ends with `None` on natural
/// completion or yields a classified error.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Everything a backend needs to start generating for a flushed batch.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub thread_id: Option<ThreadId>,
    pub system_prompt: Option<String>,
    pub prior_turns: Vec<Turn>,
    pub new_input: String,
    /// Cancelled when newer input supersedes this request. Backends should
    /// stop reading from the network once it fires.
    pub cancellation_token: CancellationToken,
}

#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open a streaming attempt bound to one (credential, model) pair.
    async fn open_stream(
        &self,
        request: &GenerationRequest,
        entry: &PoolEntry,
    ) -> Result<TextStream, GenerationError>;
}
