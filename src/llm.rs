//! Generation backends, failure routing, credential rotation and failover.

pub mod backend;
pub mod failover;
pub mod openai;
pub mod pool;
pub mod routing;

pub use backend::{GenerationBackend, GenerationRequest, TextStream};
pub use failover::{ActionSink, FailoverController, GenerationOutcome, RetryPolicy};
pub use openai::OpenAiBackend;
pub use pool::{Credential, ModelSlot, PoolEntry, PoolSnapshot, RotationPool};
