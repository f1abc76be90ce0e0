//! Terminal transport: reads stdin, prints outbound actions to stdout.
//!
//! Each input line becomes one inbound message. A line of the form
//! `thread> text` targets a named thread; anything else goes to the default
//! thread. Lines starting with `name:` set the sender for that line, and
//! `/sticker keyword` sends a sticker instead of text.

use crate::messaging::traits::{InboundStream, MessageRef, Messaging};
use crate::stream::ReactionKind;
use crate::{InboundMessage, MessageContent, ThreadId};

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt as _, BufReader};

const DEFAULT_THREAD: &str = "console";
const DEFAULT_SENDER: &str = "you";
const STICKER_COMMAND: &str = "/sticker ";

/// How many sent message ids stay deletable.
const SENT_ID_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct ConsoleTransport {
    /// Ids of recently sent messages, oldest first.
    sent: Mutex<VecDeque<String>>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Split an input line into (thread, sender, text).
fn parse_line(line: &str) -> Option<(&str, &str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (thread, rest) = match line.split_once("> ") {
        Some((thread, rest)) if !thread.is_empty() && !thread.contains(char::is_whitespace) => {
            (thread, rest)
        }
        _ => (DEFAULT_THREAD, line),
    };
    let (sender, text) = match rest.split_once(": ") {
        Some((sender, text)) if !sender.is_empty() && !sender.contains(char::is_whitespace) => {
            (sender, text)
        }
        _ => (DEFAULT_SENDER, rest),
    };

    let text = text.trim();
    (!text.is_empty()).then_some((thread, sender, text))
}

fn to_inbound(thread: &str, sender: &str, text: &str) -> InboundMessage {
    let id = uuid::Uuid::new_v4().to_string();
    let mut message = InboundMessage::text(thread, id, sender, text);
    if let Some(keyword) = text.strip_prefix(STICKER_COMMAND).map(str::trim)
        && !keyword.is_empty()
    {
        message.content = MessageContent::Sticker(keyword.to_string());
    }
    message
}

impl Messaging for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let stream = async_stream::stream! {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some((thread, sender, text)) = parse_line(&line) {
                            yield to_inbound(thread, sender, text);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "failed to read stdin");
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn send_text(
        &self,
        thread_id: &ThreadId,
        text: &str,
        quote: Option<&str>,
    ) -> crate::Result<MessageRef> {
        let platform_message_id = uuid::Uuid::new_v4().to_string();
        match quote {
            Some(quoted) => println!("[{thread_id}] (re: {quoted}) {text}"),
            None => println!("[{thread_id}] {text}"),
        }
        {
            let mut sent = self.sent.lock();
            if sent.len() >= SENT_ID_CAPACITY {
                sent.pop_front();
            }
            sent.push_back(platform_message_id.clone());
        }

        Ok(MessageRef {
            platform_message_id,
            client_message_id: None,
        })
    }

    async fn send_reaction(
        &self,
        thread_id: &ThreadId,
        target_message_id: &str,
        reaction: ReactionKind,
    ) -> crate::Result<()> {
        println!("[{thread_id}] reacted {} to {target_message_id}", reaction.emoji());
        Ok(())
    }

    async fn send_sticker(&self, thread_id: &ThreadId, keyword: &str) -> crate::Result<bool> {
        println!("[{thread_id}] <sticker: {keyword}>");
        Ok(true)
    }

    async fn delete_message(
        &self,
        thread_id: &ThreadId,
        platform_message_id: &str,
    ) -> crate::Result<bool> {
        let removed = {
            let mut sent = self.sent.lock();
            match sent.iter().position(|id| id == platform_message_id) {
                Some(position) => sent.remove(position).is_some(),
                None => false,
            }
        };
        if removed {
            println!("[{thread_id}] (message {platform_message_id} recalled)");
        }
        Ok(removed)
    }

    async fn set_typing(&self, thread_id: &ThreadId) -> crate::Result<()> {
        tracing::trace!(%thread_id, "typing");
        Ok(())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        tracing::info!("console transport shut down");
        Ok(())
    }
}
