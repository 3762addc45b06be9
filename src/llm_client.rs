//! The upstream LLM transport — an external collaborator.
//!
//! The core depends only on [`LLMClient`]; a concrete provider transport is
//! out of scope. [`MockLlmClient`] drives the test suite and the
//! `tests/scenarios.rs` integration tests; [`HttpLlmClient`] is a minimal
//! streaming-chat-completions transport: a provider-agnostic SSE-chunked
//! POST.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppResult;

/// One message in the conversation sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

/// A tool descriptor exposed to the model for this call, in the shape the
/// transport serializes into the provider's tool-calling schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One chunk of a streaming completion.
#[derive(Debug, Clone)]
pub enum LlmChunk {
    /// An increment of assistant text.
    ContentDelta(String),
    /// The model wants to invoke a tool.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Terminal chunk carrying token accounting, if the provider reports it.
    Usage { total_tokens: u64 },
}

/// Callback invoked once per chunk as it arrives from the transport.
///
/// Callers MUST ensure this closure mutates state reachable through a
/// lookup (e.g. the streaming engine's active-stream table), never a copy
/// captured at call time. The [`crate::streaming::StreamingEngine::append`] callback this
/// type is built to feed is written that way.
pub type ChunkCallback = Arc<dyn Fn(LlmChunk) + Send + Sync>;

/// A materialised handle to a tenant's LLM provider.
#[async_trait]
pub trait LLMClient: Send + Sync + fmt::Debug {
    /// The model identifier this client is configured for.
    fn model(&self) -> &str;

    /// Open a streaming chat completion, invoking `on_chunk` for every
    /// chunk the transport decodes. Returns once the stream has ended
    /// (normally or via the passed-in cancellation token).
    async fn stream_chat(
        &self,
        messages: Vec<LlmMessage>,
        tools: Vec<LlmToolSpec>,
        on_chunk: ChunkCallback,
    ) -> AppResult<()>;

    /// Best-effort liveness probe performed once on cache load;
    /// failure is logged, never fatal.
    async fn probe(&self) -> AppResult<()> {
        Ok(())
    }
}

/// A fixed-script client used by tests and local development: replays a
/// canned sequence of chunks rather than calling a real provider.
#[derive(Debug, Clone)]
pub struct MockLlmClient {
    model: String,
    script: Vec<MockStep>,
}

#[derive(Debug, Clone)]
pub enum MockStep {
    Delta(String),
    ToolCall { id: String, name: String, arguments: Value },
    Usage { total_tokens: u64 },
}

impl MockLlmClient {
    pub fn new(model: impl Into<String>, script: Vec<MockStep>) -> Self {
        Self {
            model: model.into(),
            script,
        }
    }

    /// A client that just streams `text` as per-token deltas split on
    /// whitespace, matching the fixture used across `tests/scenarios.rs`.
    pub fn echoing(model: impl Into<String>, text: &str) -> Self {
        let script = text
            .split_inclusive(' ')
            .map(|tok| MockStep::Delta(tok.to_string()))
            .collect();
        Self::new(model, script)
    }
}

#[async_trait]
impl LLMClient for MockLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        _messages: Vec<LlmMessage>,
        _tools: Vec<LlmToolSpec>,
        on_chunk: ChunkCallback,
    ) -> AppResult<()> {
        for step in &self.script {
            match step {
                MockStep::Delta(text) => on_chunk(LlmChunk::ContentDelta(text.clone())),
                MockStep::ToolCall { id, name, arguments } => on_chunk(LlmChunk::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                MockStep::Usage { total_tokens } => on_chunk(LlmChunk::Usage {
                    total_tokens: *total_tokens,
                }),
            }
        }
        Ok(())
    }
}

/// HTTP streaming client over a chunked-JSON-lines completions endpoint.
///
/// POSTs a messages array plus tool specs and parses an SSE/JSONL body, as
/// a provider-agnostic transport — the core treats the provider as an
/// external collaborator.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LLMClient for HttpLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        messages: Vec<LlmMessage>,
        tools: Vec<LlmToolSpec>,
        on_chunk: ChunkCallback,
    ) -> AppResult<()> {
        use crate::error::AppError;
        use futures::StreamExt;

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "tools": tools,
            "stream": true,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "upstream returned {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        while let Some(next) = stream.next().await {
            let bytes = next.map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(idx) = buf.find('\n') {
                let line = buf[..idx].trim().to_string();
                buf.drain(..=idx);
                if line.is_empty() {
                    continue;
                }
                let line = line.strip_prefix("data: ").unwrap_or(&line);
                if line == "[DONE]" {
                    return Ok(());
                }
                if let Ok(chunk) = serde_json::from_str::<Value>(line) {
                    if let Some(delta) = chunk["delta"].as_str() {
                        on_chunk(LlmChunk::ContentDelta(delta.to_string()));
                    } else if chunk["tool_call"].is_object() {
                        let tc = &chunk["tool_call"];
                        on_chunk(LlmChunk::ToolCall {
                            id: tc["id"].as_str().unwrap_or_default().to_string(),
                            name: tc["name"].as_str().unwrap_or_default().to_string(),
                            arguments: tc["arguments"].clone(),
                        });
                    } else if let Some(total) = chunk["total_tokens"].as_u64() {
                        on_chunk(LlmChunk::Usage { total_tokens: total });
                    }
                }
            }
        }
        Ok(())
    }

    async fn probe(&self) -> AppResult<()> {
        use crate::error::AppError;
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        self.http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn mock_client_replays_deltas_in_order() {
        let client = MockLlmClient::echoing("test-model", "Hello world");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: ChunkCallback = Arc::new(move |chunk| {
            if let LlmChunk::ContentDelta(text) = chunk {
                seen2.lock().unwrap().push(text);
            }
        });
        client.stream_chat(vec![], vec![], cb).await.unwrap();
        assert_eq!(seen.lock().unwrap().join(""), "Hello world");
    }

    #[tokio::test]
    async fn mock_client_emits_tool_calls() {
        let client = MockLlmClient::new(
            "test-model",
            vec![MockStep::ToolCall {
                id: "tc-1".into(),
                name: "database_query".into(),
                arguments: serde_json::json!({"query": "SELECT 1"}),
            }],
        );
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let cb: ChunkCallback = Arc::new(move |chunk| {
            if let LlmChunk::ToolCall { id, .. } = chunk {
                *seen2.lock().unwrap() = Some(id);
            }
        });
        client.stream_chat(vec![], vec![], cb).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("tc-1"));
    }
}
