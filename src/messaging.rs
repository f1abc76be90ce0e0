//! Chat transports.

pub mod console;
pub mod traits;

pub use console::ConsoleTransport;
pub use traits::{InboundStream, MessageRef, Messaging, MessagingDyn};
