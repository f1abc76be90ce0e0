//! Top-level error types for murmur.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing environment variable {0} referenced by a credential")]
    MissingEnv(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Generation backend, routing and rotation-pool errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no eligible model/credential left in the rotation pool")]
    PoolExhausted,

    #[error("rotation pool has no models configured")]
    EmptyPool,

    #[error("model {0} has no credentials")]
    NoCredentials(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classified failure of one streaming attempt against the generation backend.
///
/// The controller decides what to do next purely from the variant: rotate on
/// `RateLimited`, back off and retry on `Transient`, give up on `Fatal`, stop
/// silently on `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend failure: {0}")]
    Fatal(String),

    #[error("generation cancelled")]
    Cancelled,
}

/// Chat transport errors. Always treated as best-effort by callers.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
