//! Failure classification and retry timing for generation attempts.

use crate::error::GenerationError;
use std::time::Duration;

/// Max retries after the first attempt on retriable errors.
pub const MAX_RETRIES: usize = 3;

/// Base delay for exponential backoff between retries (milliseconds).
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Upper bound on a single backoff sleep.
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Backoff before `attempt` (1-based for retries): `base * 2^(attempt - 1)`.
pub fn backoff_delay(base_delay_ms: u64, attempt: usize) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(16);
    let delay_ms = base_delay_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(delay_ms)
}

/// Whether an HTTP status code should trigger a retry or rotation.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Whether an error message indicates a retriable failure.
pub fn is_retriable_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    // Rate limits and server errors
    lower.contains("429")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("rate limit")
        || lower.contains("overloaded")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        // Empty/malformed responses are transient provider issues
        || lower.contains("empty response")
        || lower.contains("failed to read response body")
        || lower.contains("error decoding response body")
}

/// Whether an error indicates an actual rate limit (429) vs other transient failures.
/// Only rate limits rotate credentials; timeouts and 5xx just back off.
pub fn is_rate_limit_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("quota")
        || lower.contains("too many requests")
}

/// Classify an HTTP error response.
pub fn classify_status(status: u16, body: &str) -> GenerationError {
    let detail = format!("HTTP {status}: {}", truncate_body(body));
    if status == 429 || ((400..500).contains(&status) && is_rate_limit_error(body)) {
        GenerationError::RateLimited(detail)
    } else if is_retriable_status(status) {
        GenerationError::Transient(detail)
    } else {
        GenerationError::Fatal(detail)
    }
}

/// Classify a free-form transport error message.
pub fn classify_error_message(error_message: &str) -> GenerationError {
    if is_rate_limit_error(error_message) {
        GenerationError::RateLimited(error_message.to_string())
    } else if is_retriable_error(error_message) {
        GenerationError::Transient(error_message.to_string())
    } else {
        GenerationError::Fatal(error_message.to_string())
    }
}

fn truncate_body(body: &str) -> &str {
    const MAX_BODY_CHARS: usize = 300;
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((byte_index, _)) => &body[..byte_index],
        None => body,
    }
}
