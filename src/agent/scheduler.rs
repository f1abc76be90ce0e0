//! Per-thread debounce, eager cancellation and serialized batch processing.
//!
//! Every inbound message for a thread:
//!
//! 1. joins the thread's pending batch,
//! 2. cancels whatever generation the thread is currently running,
//! 3. restarts the typing indicator loop,
//! 4. resets the debounce timer.
//!
//! When the timer fires the pending batch is swapped out and queued as a new
//! generation. One processing loop per thread drains that queue in flush
//! order, so at most one generation dispatches into a thread at any instant.

use crate::agent::dispatcher::ChatDispatcher;
use crate::conversation::ReceivedMessage;
use crate::llm::{FailoverController, GenerationOutcome, GenerationRequest};
use crate::messaging::InboundStream;
use crate::{GatewayDeps, InboundMessage, ProcessEvent, ThreadId};

use futures::StreamExt as _;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A flushed batch waiting for (or undergoing) generation.
#[derive(Debug)]
struct GenerationTask {
    generation: u64,
    cancellation_token: CancellationToken,
    batch: Vec<ReceivedMessage>,
    prior_history: Vec<ReceivedMessage>,
    request: GenerationRequest,
}

#[derive(Debug, Default)]
struct ThreadSlot {
    pending: Vec<InboundMessage>,
    /// Token of the most recently flushed generation. Cancelling it also
    /// covers every older generation, since each flush follows a message that
    /// already cancelled its predecessor.
    cancellation_token: CancellationToken,
    generation: u64,
    /// Bumped by every inbound message. A debounce timer only flushes if no
    /// newer message re-armed the timer after it was spawned.
    debounce_epoch: u64,
    debounce: Option<JoinHandle<()>>,
    typing: Option<JoinHandle<()>>,
    queue: VecDeque<GenerationTask>,
    processing: bool,
    processor: Option<JoinHandle<()>>,
}

impl ThreadSlot {
    fn stop_typing(&mut self) {
        if let Some(handle) = self.typing.take() {
            handle.abort();
        }
    }
}

struct SchedulerInner {
    deps: GatewayDeps,
    threads: Mutex<HashMap<ThreadId, ThreadSlot>>,
    /// Generation numbers are scheduler-wide so they keep increasing for a
    /// thread even after its idle slot was released.
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Routes inbound messages into per-thread generation tasks.
#[derive(Clone)]
pub struct ThreadScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("threads", &self.inner.threads.lock().len())
            .finish_non_exhaustive()
    }
}

impl ThreadScheduler {
    pub fn new(deps: GatewayDeps) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                deps,
                threads: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Feed every message from a transport stream until it ends.
    pub async fn run(&self, mut inbound: InboundStream) {
        while let Some(message) = inbound.next().await {
            self.on_inbound_message(message);
        }
        tracing::info!("inbound stream ended");
    }

    pub fn on_inbound_message(&self, message: InboundMessage) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(
                thread_id = %message.thread_id,
                "dropping message during shutdown"
            );
            return;
        }

        let coalesce = **self.inner.deps.runtime_config.coalesce.load();
        let thread_id = message.thread_id.clone();
        tracing::debug!(thread_id = %thread_id, message_id = %message.id, "inbound message");

        let mut threads = self.inner.threads.lock();
        let slot = threads.entry(thread_id.clone()).or_default();
        slot.pending.push(message);

        if !slot.cancellation_token.is_cancelled() && slot.generation > 0 {
            tracing::debug!(
                thread_id = %thread_id,
                generation = slot.generation,
                "cancelling superseded generation"
            );
        }
        slot.cancellation_token.cancel();

        slot.stop_typing();
        let transport = self.inner.deps.transport.clone();
        let typing_thread = thread_id.clone();
        let refresh = coalesce.typing_refresh();
        slot.typing = Some(tokio::spawn(async move {
            loop {
                if let Err(error) = transport.set_typing(&typing_thread).await {
                    tracing::debug!(
                        thread_id = %typing_thread,
                        %error,
                        "failed to refresh typing indicator"
                    );
                }
                tokio::time::sleep(refresh).await;
            }
        }));

        if let Some(handle) = slot.debounce.take() {
            handle.abort();
        }
        slot.debounce_epoch += 1;
        let epoch = slot.debounce_epoch;
        let inner = self.inner.clone();
        let debounce = coalesce.debounce();
        slot.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            SchedulerInner::flush(&inner, &thread_id, epoch);
        }));
    }

    /// Cancel every generation, stop all timers and wait for processing loops.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let processors: Vec<JoinHandle<()>> = {
            let mut threads = self.inner.threads.lock();
            threads
                .values_mut()
                .filter_map(|slot| {
                    slot.cancellation_token.cancel();
                    for task in &slot.queue {
                        task.cancellation_token.cancel();
                    }
                    if let Some(handle) = slot.debounce.take() {
                        handle.abort();
                    }
                    slot.stop_typing();
                    slot.processor.take()
                })
                .collect()
        };

        tracing::info!(loops = processors.len(), "waiting for generation loops to stop");
        for handle in processors {
            if let Err(error) = handle.await
                && !error.is_cancelled()
            {
                tracing::warn!(%error, "generation loop panicked");
            }
        }
    }

    /// Wait until no thread has pending input, queued batches or a running
    /// generation.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.threads.lock().values().all(|slot| {
                slot.pending.is_empty() && slot.queue.is_empty() && !slot.processing
            });
            if idle {
                return;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Number of threads with an active processing loop.
    pub fn active_threads(&self) -> usize {
        self.inner
            .threads
            .lock()
            .values()
            .filter(|slot| slot.processing)
            .count()
    }
}

impl SchedulerInner {
    /// Swap out the pending batch and queue it as a new generation.
    ///
    /// `epoch` is the debounce epoch the timer was armed with. A timer that
    /// already woke when a newer message arrived cannot be aborted any more,
    /// so it is ignored here instead.
    fn flush(inner: &Arc<Self>, thread_id: &ThreadId, epoch: u64) {
        let mut threads = inner.threads.lock();
        let Some(slot) = threads.get_mut(thread_id) else {
            return;
        };
        if slot.debounce_epoch != epoch {
            tracing::trace!(thread_id = %thread_id, epoch, "ignoring superseded debounce timer");
            return;
        }
        if slot.pending.is_empty() || inner.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let batch = std::mem::take(&mut slot.pending);
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        slot.generation = generation;
        let cancellation_token = CancellationToken::new();
        slot.cancellation_token = cancellation_token.clone();

        let new_input = render_batch(&batch);
        let (prior_history, prior_turns) =
            inner.deps.history.begin_batch(thread_id, &batch, &new_input);
        let request = GenerationRequest {
            thread_id: Some(thread_id.clone()),
            system_prompt: inner.deps.runtime_config.reply.load().system_prompt.clone(),
            prior_turns,
            new_input,
            cancellation_token: cancellation_token.clone(),
        };

        tracing::debug!(
            thread_id = %thread_id,
            generation,
            messages = batch.len(),
            "flushing batch"
        );
        inner.deps.emit(ProcessEvent::BatchFlushed {
            thread_id: thread_id.clone(),
            generation,
            message_count: batch.len(),
        });

        slot.queue.push_back(GenerationTask {
            generation,
            cancellation_token,
            batch: batch.iter().map(ReceivedMessage::from).collect(),
            prior_history,
            request,
        });

        if !slot.processing {
            slot.processing = true;
            let inner = inner.clone();
            let thread_id = thread_id.clone();
            slot.processor = Some(tokio::spawn(async move {
                inner.process_loop(thread_id).await;
            }));
        }
    }

    /// Drain the thread's queue in flush order.
    ///
    /// Once the queue is empty the typing loop stops, and a thread with no
    /// pending input is released entirely.
    async fn process_loop(self: Arc<Self>, thread_id: ThreadId) {
        loop {
            let task = {
                let mut threads = self.threads.lock();
                let Some(slot) = threads.get_mut(&thread_id) else {
                    return;
                };
                match slot.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        slot.processing = false;
                        if slot.pending.is_empty() {
                            slot.stop_typing();
                            threads.remove(&thread_id);
                            tracing::trace!(thread_id = %thread_id, "released idle thread");
                        }
                        return;
                    }
                }
            };

            self.process(&thread_id, task).await;
        }
    }

    async fn process(&self, thread_id: &ThreadId, task: GenerationTask) {
        let generation = task.generation;
        if task.cancellation_token.is_cancelled() {
            tracing::debug!(thread_id = %thread_id, generation, "skipping superseded batch");
            self.deps.emit(ProcessEvent::GenerationCancelled {
                thread_id: thread_id.clone(),
                generation,
            });
            return;
        }

        self.deps.emit(ProcessEvent::GenerationStarted {
            thread_id: thread_id.clone(),
            generation,
        });

        let policy = self.deps.runtime_config.retry.load().policy();
        let controller =
            FailoverController::new(self.deps.pool.clone(), self.deps.backend.clone(), policy);
        let mut dispatcher = ChatDispatcher::new(
            self.deps.clone(),
            thread_id.clone(),
            task.batch,
            task.prior_history,
        );

        let event = match controller.run(&task.request, &mut dispatcher).await {
            GenerationOutcome::Completed => {
                tracing::debug!(thread_id = %thread_id, generation, "generation completed");
                ProcessEvent::GenerationCompleted {
                    thread_id: thread_id.clone(),
                    generation,
                }
            }
            GenerationOutcome::Cancelled => {
                tracing::debug!(thread_id = %thread_id, generation, "generation cancelled");
                ProcessEvent::GenerationCancelled {
                    thread_id: thread_id.clone(),
                    generation,
                }
            }
            GenerationOutcome::Failed(error) => {
                tracing::warn!(thread_id = %thread_id, generation, %error, "generation failed");
                ProcessEvent::GenerationFailed {
                    thread_id: thread_id.clone(),
                    generation,
                    error: error.to_string(),
                }
            }
        };
        self.deps.emit(event);
    }
}

/// The backend input for a batch: one line per message, with its index.
fn render_batch(batch: &[InboundMessage]) -> String {
    batch
        .iter()
        .enumerate()
        .map(|(index, message)| {
            format!("[{index}] {}: {}", message.author(), message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{SchedulerInner, ThreadScheduler, render_batch};
    use crate::config::CoalesceConfig;
    use crate::testing::{ScriptedAttempt, ScriptedBackend, harness};
    use crate::{InboundMessage, ProcessEvent, ThreadId};
    use std::time::Duration;

    const COALESCE: CoalesceConfig = CoalesceConfig {
        debounce_ms: 50,
        typing_refresh_ms: 20,
    };

    async fn wait_for(
        events: &mut tokio::sync::broadcast::Receiver<ProcessEvent>,
        mut predicate: impl FnMut(&ProcessEvent) -> bool,
    ) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrives in time")
    }

    fn completed(event: &ProcessEvent) -> bool {
        matches!(event, ProcessEvent::GenerationCompleted { .. })
    }

    #[test]
    fn batch_lists_indexed_authors() {
        let mut named = InboundMessage::text("t", "m2", "u2", "second");
        named.sender_name = Some("Bob".into());
        let batch = vec![InboundMessage::text("t", "m1", "alice", "first"), named];
        assert_eq!(render_batch(&batch), "[0] alice: first\n[1] Bob: second");
    }

    #[tokio::test]
    async fn burst_is_coalesced_into_one_generation() {
        let harness = harness(
            ScriptedBackend::new(vec![ScriptedAttempt::chunks(&["[msg]hey both[/msg]"])]),
            COALESCE,
        );
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "hi"));
        scheduler.on_inbound_message(InboundMessage::text("t", "m2", "bob", "hello"));

        let flushed = wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::BatchFlushed { .. })
        })
        .await;
        assert!(matches!(
            flushed,
            ProcessEvent::BatchFlushed {
                message_count: 2,
                generation: 1,
                ..
            }
        ));
        wait_for(&mut events, completed).await;

        assert_eq!(harness.backend.opened(), 1);
        assert_eq!(
            harness.backend.requests()[0].new_input,
            "[0] alice: hi\n[1] bob: hello"
        );
        assert_eq!(harness.transport.sent_texts(), vec!["hey both".to_string()]);
        assert!(harness.transport.typing_count() >= 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn superseded_debounce_timer_does_not_flush() {
        let harness = harness(
            ScriptedBackend::new(vec![ScriptedAttempt::chunks(&["[msg]ok[/msg]"])]),
            COALESCE,
        );
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());
        let thread: ThreadId = "t".into();

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "one"));
        scheduler.on_inbound_message(InboundMessage::text("t", "m2", "alice", "two"));

        // The timer armed by the first message fires late, after the second
        // message re-armed the debounce.
        SchedulerInner::flush(&scheduler.inner, &thread, 1);
        {
            let threads = scheduler.inner.threads.lock();
            let slot = threads.get(&thread).expect("thread slot");
            assert_eq!(slot.pending.len(), 2);
            assert!(slot.queue.is_empty());
        }

        let flushed = wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::BatchFlushed { .. })
        })
        .await;
        assert!(matches!(flushed, ProcessEvent::BatchFlushed { message_count: 2, .. }));
        wait_for(&mut events, completed).await;
        assert_eq!(harness.backend.opened(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn new_message_cancels_in_flight_generation() {
        let backend = ScriptedBackend::new(vec![
            ScriptedAttempt::chunks(&["[msg]one[/msg]", "[msg]two[/msg]", "[msg]three[/msg]"])
                .with_delay(Duration::from_millis(100)),
        ]);
        backend.push(ScriptedAttempt::chunks(&["[msg]fresh[/msg]"]));
        let harness = harness(backend, COALESCE);
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "first"));
        wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::ActionDispatched { .. })
        })
        .await;

        scheduler.on_inbound_message(InboundMessage::text("t", "m2", "alice", "actually"));
        let first_request = harness.backend.requests()[0].clone();
        assert!(first_request.cancellation_token.is_cancelled());

        let cancelled = wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::GenerationCancelled { .. })
        })
        .await;
        assert!(matches!(
            cancelled,
            ProcessEvent::GenerationCancelled { generation: 1, .. }
        ));
        let completed = wait_for(&mut events, completed).await;
        assert!(matches!(
            completed,
            ProcessEvent::GenerationCompleted { generation: 2, .. }
        ));

        let texts = harness.transport.sent_texts();
        assert_eq!(texts.first().map(String::as_str), Some("one"));
        assert_eq!(texts.last().map(String::as_str), Some("fresh"));
        assert!(!texts.contains(&"three".to_string()));

        let second_request = &harness.backend.requests()[1];
        assert_eq!(second_request.new_input, "[0] alice: actually");
        assert_eq!(second_request.prior_turns[0].content, "[0] alice: first");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn batch_flushed_during_a_cycle_waits_for_the_same_loop() {
        let harness = harness(
            ScriptedBackend::new(vec![
                ScriptedAttempt::chunks(&["[msg]one[/msg]", "[msg]two[/msg]"]),
                ScriptedAttempt::chunks(&["[msg]fresh[/msg]"]),
            ]),
            COALESCE,
        );
        harness.transport.delay_sends(Duration::from_millis(400));
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "first"));
        // Wait until the first cycle is stuck inside its first send.
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.transport.sent_texts().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first send starts");

        scheduler.on_inbound_message(InboundMessage::text("t", "m2", "alice", "second"));
        wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::BatchFlushed { generation: 2, .. })
        })
        .await;
        assert_eq!(scheduler.active_threads(), 1);
        {
            let threads = scheduler.inner.threads.lock();
            let slot = threads.values().next().expect("thread slot");
            assert!(slot.processing);
            assert_eq!(slot.queue.len(), 1);
        }

        let mut lifecycle = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.expect("event stream open") {
                    ProcessEvent::GenerationStarted { generation, .. } => {
                        lifecycle.push(format!("start:{generation}"));
                    }
                    ProcessEvent::GenerationCancelled { generation, .. } => {
                        lifecycle.push(format!("cancel:{generation}"));
                    }
                    ProcessEvent::GenerationCompleted { generation, .. } => {
                        lifecycle.push(format!("complete:{generation}"));
                        if generation == 2 {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("second generation completes");

        assert_eq!(lifecycle, vec!["cancel:1", "start:2", "complete:2"]);
        assert_eq!(harness.transport.sent_texts(), vec!["one", "fresh"]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn finished_cycle_stops_typing_and_releases_thread() {
        let harness = harness(
            ScriptedBackend::new(vec![ScriptedAttempt::chunks(&["[msg]done[/msg]"])]),
            COALESCE,
        );
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "hi"));
        wait_for(&mut events, completed).await;
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .expect("thread goes idle");

        let typing_after_completion = harness.transport.typing_count();
        assert!(typing_after_completion >= 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(harness.transport.typing_count(), typing_after_completion);
        assert!(scheduler.inner.threads.lock().is_empty());
        assert_eq!(scheduler.active_threads(), 0);
    }

    #[tokio::test]
    async fn threads_are_independent() {
        let harness = harness(
            ScriptedBackend::new(vec![
                ScriptedAttempt::chunks(&["[msg]a[/msg]"]),
                ScriptedAttempt::chunks(&["[msg]b[/msg]"]),
            ]),
            COALESCE,
        );
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("left", "m1", "alice", "hi"));
        scheduler.on_inbound_message(InboundMessage::text("right", "m2", "bob", "hi"));

        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .expect("both threads finish");
        let completed = std::iter::from_fn(|| events.try_recv().ok())
            .filter(completed)
            .count();
        assert_eq!(completed, 2);
        let first = harness.backend.requests()[0].cancellation_token.clone();
        assert!(!first.is_cancelled());
        assert_eq!(harness.backend.opened(), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failure_is_reported_and_thread_stays_usable() {
        let harness = harness(
            ScriptedBackend::new(vec![
                ScriptedAttempt::open_error(crate::error::GenerationError::Fatal("401".into())),
                ScriptedAttempt::chunks(&["[msg]back[/msg]"]),
            ]),
            COALESCE,
        );
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "hi"));
        wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::GenerationFailed { .. })
        })
        .await;
        assert_eq!(
            harness.transport.sent_texts(),
            vec!["sorry, try again".to_string()]
        );

        scheduler.on_inbound_message(InboundMessage::text("t", "m2", "alice", "again"));
        let completed = wait_for(&mut events, completed).await;
        assert!(matches!(
            completed,
            ProcessEvent::GenerationCompleted { generation: 2, .. }
        ));
        assert_eq!(
            harness.transport.sent_texts().last().map(String::as_str),
            Some("back")
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_processing_and_ignores_new_input() {
        let harness = harness(
            ScriptedBackend::new(vec![
                ScriptedAttempt::chunks(&["[msg]slow[/msg]", "[msg]slower[/msg]"])
                    .with_delay(Duration::from_secs(30)),
            ]),
            COALESCE,
        );
        let mut events = harness.deps.event_tx.subscribe();
        let scheduler = ThreadScheduler::new(harness.deps.clone());

        scheduler.on_inbound_message(InboundMessage::text("t", "m1", "alice", "hi"));
        wait_for(&mut events, |event| {
            matches!(event, ProcessEvent::GenerationStarted { .. })
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("shutdown completes");
        assert_eq!(scheduler.active_threads(), 0);

        let opened = harness.backend.opened();
        assert!(opened <= 1);
        scheduler.on_inbound_message(InboundMessage::text("t", "m2", "alice", "hello?"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(harness.backend.opened(), opened);
    }
}
