//! OpenAI-compatible chat completions backend with SSE streaming.

use crate::conversation::{Turn, TurnRole};
use crate::error::{GenerationError, LlmError};
use crate::llm::backend::{GenerationBackend, GenerationRequest, TextStream};
use crate::llm::pool::PoolEntry;
use crate::llm::routing;

use anyhow::Context as _;
use futures::StreamExt as _;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams `/chat/completions` from any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    http_client: reqwest::Client,
    base_url: String,
}

impl OpenAiBackend {
    /// `read_timeout` bounds the gap between two reads of the response, so a
    /// long reply keeps streaming as long as chunks keep arriving.
    pub fn new(base_url: impl Into<String>, read_timeout: Duration) -> Result<Self, LlmError> {
        let http_client = client_builder(read_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::from_client(base_url, http_client))
    }

    fn from_client(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn open_stream(
        &self,
        request: &GenerationRequest,
        entry: &PoolEntry,
    ) -> Result<TextStream, GenerationError> {
        let body = build_request_body(request, &entry.model);
        let cancel = request.cancellation_token.clone();

        let send = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(entry.credential.expose())
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            response = send => response.map_err(classify_reqwest_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(routing::classify_status(status.as_u16(), &text));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = bytes.next() => Some(chunk),
                };

                let chunk = match next {
                    None => {
                        yield Err(GenerationError::Cancelled);
                        break;
                    }
                    Some(None) => {
                        if !decoder.done {
                            yield Err(GenerationError::Transient(
                                "stream ended before [DONE]".into(),
                            ));
                        }
                        break;
                    }
                    Some(Some(Err(error))) => {
                        yield Err(classify_reqwest_error(error));
                        break;
                    }
                    Some(Some(Ok(chunk))) => chunk,
                };

                let mut failed = false;
                for data in decoder.feed(&chunk) {
                    match parse_delta(&data) {
                        Ok(Some(text)) if !text.is_empty() => {
                            yield Ok(text);
                        }
                        Ok(_) => {}
                        Err(error) => {
                            yield Err(error);
                            failed = true;
                            break;
                        }
                    }
                }
                if failed || decoder.done {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn client_builder(read_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout)
}

fn build_request_body(request: &GenerationRequest, model: &str) -> serde_json::Value {
    let mut messages = Vec::with_capacity(request.prior_turns.len() + 2);
    if let Some(system_prompt) = &request.system_prompt {
        messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
    }
    messages.extend(request.prior_turns.iter().map(turn_to_message));
    messages.push(serde_json::json!({"role": "user", "content": request.new_input}));

    serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
    })
}

fn turn_to_message(turn: &Turn) -> serde_json::Value {
    match turn.role {
        TurnRole::User => serde_json::json!({"role": "user", "content": turn.content}),
        TurnRole::Assistant => serde_json::json!({"role": "assistant", "content": turn.content}),
        // Tool output is replayed as user-visible context; the tag protocol
        // has no native tool-call ids to pair it with.
        TurnRole::Tool => serde_json::json!({
            "role": "user",
            "content": format!("[tool result]\n{}", turn.content),
        }),
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> GenerationError {
    if error.is_timeout() || error.is_connect() {
        return GenerationError::Transient(error.to_string());
    }
    if let Some(status) = error.status() {
        return routing::classify_status(status.as_u16(), &error.to_string());
    }
    routing::classify_error_message(&error.to_string())
}

/// Extract the text delta from one SSE `data:` payload.
fn parse_delta(data: &str) -> Result<Option<String>, GenerationError> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|error| GenerationError::Transient(format!("malformed stream event: {error}")))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown provider error");
        return Err(routing::classify_error_message(message));
    }

    Ok(value
        .pointer("/choices/0/delta/content")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string))
}

/// Line-oriented decoder for `text/event-stream` bodies.
///
/// Bytes may split lines (and UTF-8 sequences) arbitrarily, so input is
/// buffered until a newline arrives.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes, returning every complete `data:` payload.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                self.done = true;
                break;
            }
            if !data.is_empty() {
                events.push(data.to_string());
            }
        }

        events
    }
}
