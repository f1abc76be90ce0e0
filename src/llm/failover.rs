//! Retry/failover controller around streaming generation attempts.
//!
//! One call to [`FailoverController::run`] answers one flushed batch. Each
//! attempt binds to the rotation pool's current pair, streams chunks into a
//! [`StreamParser`] and forwards completed actions to an [`ActionSink`].
//! Rate limits rotate the pool, transient failures back off and retry, fatal
//! failures surface once through `on_error`.

use crate::error::GenerationError;
use crate::llm::backend::{GenerationBackend, GenerationRequest};
use crate::llm::pool::{PoolEntry, RotationPool};
use crate::llm::routing;
use crate::stream::{ReactionKind, StreamAction, StreamParser};
use crate::tools::ToolInvocation;

use futures::StreamExt as _;
use std::sync::Arc;

/// Receives the side effects of one generation.
///
/// `on_complete` and `on_error` are each called at most once per run, and
/// never both.
#[async_trait::async_trait]
pub trait ActionSink: Send {
    async fn on_reaction(&mut self, index: Option<i64>, kind: ReactionKind);
    async fn on_sticker(&mut self, keyword: &str);
    async fn on_message(&mut self, text: &str, quote: Option<i64>);
    async fn on_undo(&mut self, index: i64);
    async fn on_tool(&mut self, invocation: &ToolInvocation);
    async fn on_complete(&mut self);
    async fn on_error(&mut self, error: &GenerationError);
}

/// Retry budget, read from the runtime config at the start of each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: routing::MAX_RETRIES,
            base_delay_ms: routing::RETRY_BASE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed(GenerationError),
}

/// Tracks the exactly-once terminal callbacks of one run.
#[derive(Debug, Default)]
struct Terminal {
    completed: bool,
    errored: bool,
}

impl Terminal {
    async fn complete<S: ActionSink + ?Sized>(&mut self, sink: &mut S) {
        if self.completed || self.errored {
            return;
        }
        self.completed = true;
        sink.on_complete().await;
    }

    async fn fail<S: ActionSink + ?Sized>(&mut self, sink: &mut S, error: &GenerationError) {
        if self.completed || self.errored {
            return;
        }
        self.errored = true;
        sink.on_error(error).await;
    }
}

#[derive(Clone)]
pub struct FailoverController {
    pool: Arc<RotationPool>,
    backend: Arc<dyn GenerationBackend>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverController")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FailoverController {
    pub fn new(
        pool: Arc<RotationPool>,
        backend: Arc<dyn GenerationBackend>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            backend,
            policy,
        }
    }

    /// Generate a reply for `request`, dispatching actions into `sink`.
    pub async fn run<S: ActionSink + ?Sized>(
        &self,
        request: &GenerationRequest,
        sink: &mut S,
    ) -> GenerationOutcome {
        let cancel = &request.cancellation_token;
        let mut parser = StreamParser::new();
        let mut terminal = Terminal::default();
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            if cancel.is_cancelled() {
                return Self::cancelled(&mut parser, &mut terminal, sink).await;
            }
            parser.begin_attempt();

            if attempt > 0 {
                let delay = routing::backoff_delay(self.policy.base_delay_ms, attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Self::cancelled(&mut parser, &mut terminal, sink).await;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.pool.refresh();
            let entry = match self.pool.current() {
                Ok(entry) => entry,
                Err(error) => {
                    last_error = Some(GenerationError::Fatal(error.to_string()));
                    break;
                }
            };
            tracing::info!(
                thread_id = request.thread_id.as_deref().unwrap_or("-"),
                model = %entry.model,
                credential_index = entry.credential_index,
                attempt,
                "starting generation attempt"
            );

            match self.stream_attempt(request, &entry, &mut parser, sink).await {
                Ok(()) => {
                    terminal.complete(sink).await;
                    return GenerationOutcome::Completed;
                }
                Err(GenerationError::Cancelled) => {
                    return Self::cancelled(&mut parser, &mut terminal, sink).await;
                }
                Err(GenerationError::RateLimited(message)) => {
                    tracing::warn!(
                        model = %entry.model,
                        credential_index = entry.credential_index,
                        %message,
                        "generation rate limited"
                    );
                    if !self.pool.report_rate_limited(&entry) {
                        last_error = Some(GenerationError::Fatal(format!(
                            "rotation pool exhausted after rate limit: {message}"
                        )));
                        break;
                    }
                    last_error = Some(GenerationError::RateLimited(message));
                }
                Err(GenerationError::Transient(message)) => {
                    tracing::warn!(
                        model = %entry.model,
                        attempt,
                        %message,
                        "transient generation failure"
                    );
                    last_error = Some(GenerationError::Transient(message));
                }
                Err(error @ GenerationError::Fatal(_)) => {
                    last_error = Some(error);
                    break;
                }
            }
        }

        let error = match last_error {
            Some(GenerationError::Fatal(message)) => GenerationError::Fatal(message),
            Some(other) => GenerationError::Fatal(format!(
                "giving up after {} attempts: {other}",
                self.policy.max_retries + 1
            )),
            None => GenerationError::Fatal("no generation attempt was made".into()),
        };
        tracing::error!(%error, "generation failed");
        terminal.fail(sink, &error).await;
        GenerationOutcome::Failed(error)
    }

    async fn stream_attempt<S: ActionSink + ?Sized>(
        &self,
        request: &GenerationRequest,
        entry: &PoolEntry,
        parser: &mut StreamParser,
        sink: &mut S,
    ) -> Result<(), GenerationError> {
        let cancel = &request.cancellation_token;
        let mut stream = self.backend.open_stream(request, entry).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(error)) => return Err(error),
                Some(Ok(chunk)) => {
                    if cancel.is_cancelled() {
                        return Err(GenerationError::Cancelled);
                    }
                    for action in parser.push(&chunk) {
                        apply(sink, action).await;
                    }
                }
            }
        }

        for action in parser.finish() {
            apply(sink, action).await;
        }
        Ok(())
    }

    async fn cancelled<S: ActionSink + ?Sized>(
        parser: &mut StreamParser,
        terminal: &mut Terminal,
        sink: &mut S,
    ) -> GenerationOutcome {
        parser.abort();
        if parser.has_dispatched() {
            terminal.complete(sink).await;
        }
        tracing::debug!(dispatched = parser.has_dispatched(), "generation cancelled");
        GenerationOutcome::Cancelled
    }
}

async fn apply<S: ActionSink + ?Sized>(sink: &mut S, action: StreamAction) {
    match action {
        StreamAction::Reaction { index, kind } => sink.on_reaction(index, kind).await,
        StreamAction::Sticker { keyword } => sink.on_sticker(&keyword).await,
        StreamAction::Message { text, quote } => sink.on_message(&text, quote).await,
        StreamAction::Undo { index } => sink.on_undo(index).await,
        StreamAction::Tool(invocation) => sink.on_tool(&invocation).await,
    }
}
