//! Thread scheduling and action dispatch.

pub mod dispatcher;
pub mod scheduler;

pub use dispatcher::ChatDispatcher;
pub use scheduler::ThreadScheduler;
