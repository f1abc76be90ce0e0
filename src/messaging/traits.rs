//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::stream::ReactionKind;
use crate::{InboundMessage, ThreadId};

use futures::Stream;
use std::pin::Pin;

/// Message stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Identifiers of a message the transport delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// Id assigned by the platform. Required for quoting and deletion.
    pub platform_message_id: String,
    /// Id the gateway generated before sending, if the platform echoes one.
    pub client_message_id: Option<String>,
}

/// Static trait for chat transports.
/// Use this for type-safe implementations.
///
/// Every call is best-effort from the gateway's point of view: failures are
/// logged by the caller and never abort a generation.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this transport.
    fn name(&self) -> &str;

    /// Start the transport and return the inbound message stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Send a text message, optionally quoting a platform message.
    fn send_text(
        &self,
        thread_id: &ThreadId,
        text: &str,
        quote: Option<&str>,
    ) -> impl std::future::Future<Output = Result<MessageRef>> + Send;

    /// React to a platform message.
    fn send_reaction(
        &self,
        thread_id: &ThreadId,
        target_message_id: &str,
        reaction: ReactionKind,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Send a sticker matching `keyword`. Returns `false` when none matched.
    fn send_sticker(
        &self,
        _thread_id: &ThreadId,
        _keyword: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send {
        async { Ok(false) }
    }

    /// Delete (recall) a previously sent message.
    fn delete_message(
        &self,
        thread_id: &ThreadId,
        platform_message_id: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Show the typing indicator once. The scheduler refreshes it periodically.
    fn set_typing(
        &self,
        _thread_id: &ThreadId,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>;

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn MessagingDyn>` for storing a transport.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start<'a>(&'a self) -> BoxFuture<'a, InboundStream>;

    fn send_text<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        text: &'a str,
        quote: Option<&'a str>,
    ) -> BoxFuture<'a, MessageRef>;

    fn send_reaction<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        target_message_id: &'a str,
        reaction: ReactionKind,
    ) -> BoxFuture<'a, ()>;

    fn send_sticker<'a>(&'a self, thread_id: &'a ThreadId, keyword: &'a str) -> BoxFuture<'a, bool>;

    fn delete_message<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        platform_message_id: &'a str,
    ) -> BoxFuture<'a, bool>;

    fn set_typing<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, ()>;

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// Blanket implementation: any type implementing Messaging automatically implements MessagingDyn.
impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn start<'a>(&'a self) -> BoxFuture<'a, InboundStream> {
        Box::pin(Messaging::start(self))
    }

    fn send_text<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        text: &'a str,
        quote: Option<&'a str>,
    ) -> BoxFuture<'a, MessageRef> {
        Box::pin(Messaging::send_text(self, thread_id, text, quote))
    }

    fn send_reaction<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        target_message_id: &'a str,
        reaction: ReactionKind,
    ) -> BoxFuture<'a, ()> {
        Box::pin(Messaging::send_reaction(self, thread_id, target_message_id, reaction))
    }

    fn send_sticker<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        keyword: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(Messaging::send_sticker(self, thread_id, keyword))
    }

    fn delete_message<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        platform_message_id: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(Messaging::delete_message(self, thread_id, platform_message_id))
    }

    fn set_typing<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, ()> {
        Box::pin(Messaging::set_typing(self, thread_id))
    }

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Messaging::shutdown(self))
    }
}
