//! Applies parsed stream actions to a chat thread.
//!
//! One `ChatDispatcher` lives for one generation task. Transport calls are
//! best-effort: a failed send is logged and the generation keeps going.

use crate::conversation::{MessageReference, ReceivedMessage, Turn, resolve_reference};
use crate::error::GenerationError;
use crate::llm::ActionSink;
use crate::stream::ReactionKind;
use crate::tools::ToolInvocation;
use crate::{GatewayDeps, ProcessEvent, ThreadId};

#[derive(Debug)]
pub struct ChatDispatcher {
    deps: GatewayDeps,
    thread_id: ThreadId,
    /// Messages of the batch being answered, oldest first.
    batch: Vec<ReceivedMessage>,
    /// Received history preceding the batch, for out-of-batch quote indices.
    prior_history: Vec<ReceivedMessage>,
    /// Stickers are held back until the reply text has gone out.
    pending_stickers: Vec<String>,
    /// What was actually delivered, re-rendered in the tag language. Becomes
    /// the assistant turn in history.
    transcript: Vec<String>,
}

impl ChatDispatcher {
    pub fn new(
        deps: GatewayDeps,
        thread_id: ThreadId,
        batch: Vec<ReceivedMessage>,
        prior_history: Vec<ReceivedMessage>,
    ) -> Self {
        Self {
            deps,
            thread_id,
            batch,
            prior_history,
            pending_stickers: Vec::new(),
            transcript: Vec::new(),
        }
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    fn resolve(&self, index: i64) -> Option<MessageReference> {
        resolve_reference(
            &self.thread_id,
            index,
            &self.batch,
            &self.prior_history,
            &self.deps.ledger,
        )
    }

    fn dispatched(&mut self, action: &str, rendered: String) {
        self.transcript.push(rendered);
        self.deps.emit(ProcessEvent::ActionDispatched {
            thread_id: self.thread_id.clone(),
            action: action.to_string(),
        });
    }

    /// Send text and record it in the ledger. Returns whether it was delivered.
    async fn deliver_text(&mut self, text: &str, quote: Option<&str>) -> bool {
        let client_message_id = uuid::Uuid::new_v4().to_string();
        let sent = self.deps.transport.send_text(&self.thread_id, text, quote).await;
        match sent {
            Ok(sent) => {
                self.deps.ledger.record(
                    &self.thread_id,
                    sent.platform_message_id,
                    sent.client_message_id.unwrap_or(client_message_id),
                    text,
                );
                true
            }
            Err(error) => {
                tracing::warn!(thread_id = %self.thread_id, %error, "failed to send message");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl ActionSink for ChatDispatcher {
    async fn on_reaction(&mut self, index: Option<i64>, kind: ReactionKind) {
        let target_index = match index {
            Some(index) => index,
            None if self.batch.is_empty() => {
                tracing::debug!(thread_id = %self.thread_id, "reaction with no batch to target");
                return;
            }
            None => self.batch.len() as i64 - 1,
        };
        let Some(target) = self.resolve(target_index) else {
            tracing::debug!(
                thread_id = %self.thread_id,
                index = target_index,
                "reaction target not found"
            );
            return;
        };

        if let Err(error) = self
            .deps
            .transport
            .send_reaction(&self.thread_id, target.platform_message_id(), kind)
            .await
        {
            tracing::warn!(thread_id = %self.thread_id, %error, "failed to send reaction");
            return;
        }
        self.dispatched("reaction", format!("[reaction:{target_index}:{kind}]"));
    }

    async fn on_sticker(&mut self, keyword: &str) {
        self.pending_stickers.push(keyword.to_string());
    }

    async fn on_message(&mut self, text: &str, quote: Option<i64>) {
        let quoted = quote.and_then(|index| {
            let target = self.resolve(index);
            if target.is_none() {
                tracing::debug!(
                    thread_id = %self.thread_id,
                    index,
                    "quote target not found, sending unquoted"
                );
            }
            target.map(|target| (index, target.platform_message_id().to_string()))
        });

        if !self.deliver_text(text, quoted.as_ref().map(|(_, id)| id.as_str())).await {
            return;
        }
        match quoted {
            Some((index, _)) => self.dispatched("quote", format!("[quote:{index}]{text}[/quote]")),
            None => self.dispatched("message", format!("[msg]{text}[/msg]")),
        }
    }

    async fn on_undo(&mut self, index: i64) {
        if index >= 0 {
            tracing::debug!(
                thread_id = %self.thread_id,
                index,
                "undo only addresses sent messages"
            );
            return;
        }
        let Some(record) = self.deps.ledger.resolve(&self.thread_id, index) else {
            tracing::debug!(thread_id = %self.thread_id, index, "undo target not in ledger");
            return;
        };

        match self
            .deps
            .transport
            .delete_message(&self.thread_id, &record.platform_message_id)
            .await
        {
            Ok(true) => {
                self.deps.ledger.remove(&self.thread_id, &record.platform_message_id);
                self.dispatched("undo", format!("[undo:{index}]"));
            }
            Ok(false) => {
                tracing::warn!(
                    thread_id = %self.thread_id,
                    platform_message_id = %record.platform_message_id,
                    "transport refused to delete message"
                );
            }
            Err(error) => {
                tracing::warn!(thread_id = %self.thread_id, %error, "failed to delete message");
            }
        }
    }

    async fn on_tool(&mut self, invocation: &ToolInvocation) {
        let Some(tools) = self.deps.tools.clone() else {
            tracing::debug!(
                thread_id = %self.thread_id,
                tool = %invocation.name,
                "no tool executor configured"
            );
            return;
        };

        let result = match tools.execute(&self.thread_id, invocation).await {
            Ok(output) => format!("{}: {output}", invocation.name),
            Err(error) => {
                tracing::warn!(
                    thread_id = %self.thread_id,
                    tool = %invocation.name,
                    %error,
                    "tool failed"
                );
                format!("{} failed: {error}", invocation.name)
            }
        };
        self.deps.history.push_turn(&self.thread_id, Turn::tool(result));
        self.dispatched("tool", format!("[tool:{invocation}]{}[/tool]", invocation.body));
    }

    async fn on_complete(&mut self) {
        for keyword in std::mem::take(&mut self.pending_stickers) {
            match self.deps.transport.send_sticker(&self.thread_id, &keyword).await {
                Ok(true) => self.dispatched("sticker", format!("[sticker:{keyword}]")),
                Ok(false) => {
                    tracing::debug!(
                        thread_id = %self.thread_id,
                        %keyword,
                        "no sticker matched keyword"
                    );
                }
                Err(error) => {
                    tracing::warn!(thread_id = %self.thread_id, %error, "failed to send sticker");
                }
            }
        }

        if !self.transcript.is_empty() {
            self.deps
                .history
                .push_turn(&self.thread_id, Turn::assistant(self.transcript.join("\n")));
        }
    }

    async fn on_error(&mut self, error: &GenerationError) {
        tracing::error!(thread_id = %self.thread_id, %error, "giving up on reply");
        let apology = self.deps.runtime_config.reply.load().apology.clone();
        if let Some(apology) = apology
            && self.deliver_text(&apology, None).await
        {
            self.dispatched("message", format!("[msg]{apology}[/msg]"));
        }
    }
}
