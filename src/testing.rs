//! Fakes shared by unit tests: a recording transport, a scripted backend and
//! a recording action sink.

use crate::config::{CoalesceConfig, Config, RuntimeConfig};
use crate::conversation::{SentMessageLedger, ThreadHistory};
use crate::error::GenerationError;
use crate::llm::{
    ActionSink, Credential, GenerationBackend, GenerationRequest, ModelSlot, PoolEntry,
    RotationPool, TextStream,
};
use crate::messaging::{InboundStream, MessageRef, Messaging};
use crate::stream::ReactionKind;
use crate::tools::{EchoTools, ToolInvocation};
use crate::{GatewayDeps, ThreadId};

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportCall {
    Text(String, Option<String>),
    Reaction(String, ReactionKind),
    Sticker(String),
    Delete(String),
    Typing(String),
}

#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    calls: Mutex<Vec<TransportCall>>,
    sent: Mutex<HashSet<String>>,
    next_id: Mutex<u64>,
    fail_sends: Mutex<bool>,
    send_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    /// Recorded calls, typing refreshes excluded.
    pub(crate) fn calls(&self) -> Vec<TransportCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| !matches!(call, TransportCall::Typing(_)))
            .cloned()
            .collect()
    }

    pub(crate) fn typing_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, TransportCall::Typing(_)))
            .count()
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Text(text, _) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }

    /// Hold every text send for `delay` after it was recorded.
    pub(crate) fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }
}

impl Messaging for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn send_text(
        &self,
        _thread_id: &ThreadId,
        text: &str,
        quote: Option<&str>,
    ) -> crate::Result<MessageRef> {
        if *self.fail_sends.lock() {
            return Err(crate::error::MessagingError::Closed.into());
        }
        self.calls
            .lock()
            .push(TransportCall::Text(text.to_string(), quote.map(str::to_string)));
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let platform_message_id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            format!("sent-{next_id}")
        };
        self.sent.lock().insert(platform_message_id.clone());
        Ok(MessageRef {
            platform_message_id,
            client_message_id: None,
        })
    }

    async fn send_reaction(
        &self,
        _thread_id: &ThreadId,
        target_message_id: &str,
        reaction: ReactionKind,
    ) -> crate::Result<()> {
        self.calls
            .lock()
            .push(TransportCall::Reaction(target_message_id.to_string(), reaction));
        Ok(())
    }

    async fn send_sticker(&self, _thread_id: &ThreadId, keyword: &str) -> crate::Result<bool> {
        self.calls.lock().push(TransportCall::Sticker(keyword.to_string()));
        Ok(true)
    }

    async fn delete_message(
        &self,
        _thread_id: &ThreadId,
        platform_message_id: &str,
    ) -> crate::Result<bool> {
        self.calls
            .lock()
            .push(TransportCall::Delete(platform_message_id.to_string()));
        Ok(self.sent.lock().remove(platform_message_id))
    }

    async fn set_typing(&self, thread_id: &ThreadId) -> crate::Result<()> {
        self.calls.lock().push(TransportCall::Typing(thread_id.to_string()));
        Ok(())
    }
}

/// One scripted backend attempt.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedAttempt {
    open_error: Option<GenerationError>,
    chunks: Vec<String>,
    end_error: Option<GenerationError>,
    chunk_delay: Option<Duration>,
}

impl ScriptedAttempt {
    pub(crate) fn chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn open_error(error: GenerationError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::default()
        }
    }

    /// Fail the stream after every chunk was delivered.
    pub(crate) fn then_fail(mut self, error: GenerationError) -> Self {
        self.end_error = Some(error);
        self
    }

    /// Sleep before each chunk.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedBackend {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    entries: Mutex<Vec<PoolEntry>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            ..Self::default()
        }
    }

    pub(crate) fn push(&self, attempt: ScriptedAttempt) {
        self.attempts.lock().push_back(attempt);
    }

    pub(crate) fn opened(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn entries(&self) -> Vec<PoolEntry> {
        self.entries.lock().clone()
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(
        &self,
        request: &GenerationRequest,
        entry: &PoolEntry,
    ) -> Result<TextStream, GenerationError> {
        self.entries.lock().push(entry.clone());
        self.requests.lock().push(request.clone());

        let Some(attempt) = self.attempts.lock().pop_front() else {
            return Err(GenerationError::Fatal("no scripted attempt left".into()));
        };
        if let Some(error) = attempt.open_error {
            return Err(error);
        }

        let stream = async_stream::stream! {
            for chunk in attempt.chunks {
                if let Some(delay) = attempt.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if let Some(error) = attempt.end_error {
                yield Err(error);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Records every callback as a short string.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) events: Vec<String>,
}

#[async_trait::async_trait]
impl ActionSink for RecordingSink {
    async fn on_reaction(&mut self, index: Option<i64>, kind: ReactionKind) {
        let target = index.map_or_else(|| "_".to_string(), |index| index.to_string());
        self.events.push(format!("reaction:{target}:{kind}"));
    }

    async fn on_sticker(&mut self, keyword: &str) {
        self.events.push(format!("sticker:{keyword}"));
    }

    async fn on_message(&mut self, text: &str, quote: Option<i64>) {
        match quote {
            Some(index) => self.events.push(format!("quote:{index}:{text}")),
            None => self.events.push(format!("message:{text}")),
        }
    }

    async fn on_undo(&mut self, index: i64) {
        self.events.push(format!("undo:{index}"));
    }

    async fn on_tool(&mut self, invocation: &ToolInvocation) {
        self.events.push(format!("tool:{}", invocation.name));
    }

    async fn on_complete(&mut self) {
        self.events.push("complete".into());
    }

    async fn on_error(&mut self, error: &GenerationError) {
        self.events.push(format!("error:{error}"));
    }
}

pub(crate) fn request() -> GenerationRequest {
    GenerationRequest {
        thread_id: Some("t".into()),
        system_prompt: None,
        prior_turns: Vec::new(),
        new_input: "[0] alice: hi".into(),
        cancellation_token: CancellationToken::new(),
    }
}

pub(crate) struct TestHarness {
    pub(crate) deps: GatewayDeps,
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) backend: Arc<ScriptedBackend>,
}

pub(crate) fn test_deps() -> TestHarness {
    harness(ScriptedBackend::default(), CoalesceConfig::default())
}

pub(crate) fn harness(backend: ScriptedBackend, coalesce: CoalesceConfig) -> TestHarness {
    let mut config = Config::default();
    config.coalesce = coalesce;
    config.retry.base_delay_ms = 1;
    config.reply.apology = Some("sorry, try again".into());

    let pool = RotationPool::new(
        vec![ModelSlot::new("test-model", vec![Credential::new("sk-test")])],
        Duration::from_secs(3600),
    )
    .expect("valid pool");
    let transport = Arc::new(FakeTransport::default());
    let backend = Arc::new(backend);
    let (event_tx, _) = tokio::sync::broadcast::channel(64);

    let deps = GatewayDeps {
        pool: Arc::new(pool),
        backend: backend.clone(),
        transport: transport.clone(),
        tools: Some(Arc::new(EchoTools)),
        ledger: Arc::new(SentMessageLedger::default()),
        history: Arc::new(ThreadHistory::default()),
        runtime_config: Arc::new(RuntimeConfig::new(&config)),
        event_tx,
    };

    TestHarness {
        deps,
        transport,
        backend,
    }
}
