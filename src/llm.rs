//! Language model and embedding clients.
//!
//! The orchestrator only sees [`LanguageModel`]: prompt in, token stream out.
//! [`OpenAiClient`] speaks the OpenAI-compatible chat completions API in
//! streaming mode; its server-sent events body is framed with the same
//! [`FrameSplitter`] that handles this crate's own event stream.

use crate::error::{ChatBiError, Result};
use crate::semantic::vector_store::{Embedder, Embedding};
use crate::stream::codec::FrameSplitter;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DONE_PAYLOAD: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.1,
            max_tokens: None,
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Last user message, used by scripted models and logs.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start a completion. Tokens arrive as they are produced; the stream
    /// ends early when `cancel` fires.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream>;

    /// Collect a whole completion.
    async fn complete(&self, request: &CompletionRequest, cancel: &CancellationToken) -> Result<String> {
        let mut tokens = self.stream_completion(request, cancel).await?;
        let mut out = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatBiError::Cancelled),
                next = tokens.next() => match next {
                    Some(token) => out.push_str(&token?),
                    None => break,
                },
            }
        }
        Ok(out)
    }
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChatBiError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": true,
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        let send = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(request))
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatBiError::Cancelled),
            response = send => response.map_err(|e| ChatBiError::Llm(format!("LLM API call failed: {}", e)))?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ChatBiError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        debug!(model = %self.model, "LLM stream opened");
        Ok(provider_token_stream(Box::pin(response.bytes_stream()), cancel.clone()))
    }
}

struct ProviderState<S> {
    source: Option<S>,
    splitter: FrameSplitter,
    pending: VecDeque<Result<String>>,
    cancel: CancellationToken,
}

/// Turn a provider's chat-completion SSE body into content tokens.
/// Malformed chunks are skipped; a provider `error` object ends the stream
/// with an error.
pub fn provider_token_stream<S, E>(source: S, cancel: CancellationToken) -> TokenStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let state = ProviderState {
        source: Some(source),
        splitter: FrameSplitter::new(),
        pending: VecDeque::new(),
        cancel,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.source = None;
                    state.pending.clear();
                }
                return Some((item, state));
            }
            let source = state.source.as_mut()?;
            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => None,
                item = source.next() => Some(item),
            };
            let Some(next) = next else {
                state.source = None;
                return None;
            };

            let payloads = match next {
                Some(Ok(chunk)) => state.splitter.push(&chunk),
                Some(Err(e)) => {
                    state.source = None;
                    return Some((Err(ChatBiError::Llm(format!("LLM stream interrupted: {}", e))), state));
                }
                None => {
                    state.source = None;
                    state.splitter.finish()
                }
            };

            for payload in payloads {
                if payload == DONE_PAYLOAD {
                    state.source = None;
                    break;
                }
                match parse_chunk(&payload) {
                    Ok(Some(token)) => state.pending.push_back(Ok(token)),
                    Ok(None) => {}
                    Err(e) => {
                        state.pending.push_back(Err(e));
                        break;
                    }
                }
            }
        }
    }))
}

fn parse_chunk(payload: &str) -> Result<Option<String>> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("Skipping malformed LLM chunk: {}", e);
            return Ok(None);
        }
    };
    if let Some(error) = value.get("error") {
        return Err(ChatBiError::Llm(format!("LLM API error: {}", error)));
    }
    let choice = &value["choices"][0];
    let content = choice["delta"]["content"]
        .as_str()
        .or_else(|| choice["message"]["content"].as_str());
    Ok(content.filter(|c| !c.is_empty()).map(str::to_string))
}

/// OpenAI-compatible `/embeddings` client.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    async fn request(&self, input: Value) -> Result<Vec<Embedding>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({"model": self.model, "input": input}))
            .send()
            .await
            .map_err(|e| ChatBiError::Llm(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChatBiError::Llm(format!("Embedding API error ({}): {}", status, error_text)));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ChatBiError::Llm(format!("Failed to parse embedding response: {}", e)))?;
        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.request(serde_json::json!(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ChatBiError::Llm("Embedding response had no data".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(serde_json::json!(texts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(wire: &str, size: usize) -> Vec<std::result::Result<Bytes, std::io::Error>> {
        wire.as_bytes()
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    const WIRE: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"SELECT \"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"1\"}}]}\n\n",
        "data: [DONE]\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
    );

    #[tokio::test]
    async fn test_provider_stream_yields_content_until_done() {
        let source = stream::iter(chunks(WIRE, 7));
        let tokens: Vec<String> = provider_token_stream(source, CancellationToken::new())
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["SELECT ", "1"]);
    }

    #[tokio::test]
    async fn test_provider_error_object_ends_stream() {
        let wire = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"error\":{\"message\":\"rate limited\"}}\n\n";
        let items: Vec<Result<String>> = provider_token_stream(stream::iter(chunks(wire, 5)), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ChatBiError::Llm(_))));
    }

    #[tokio::test]
    async fn test_cancelled_stream_is_empty() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tokens: Vec<Result<String>> = provider_token_stream(stream::iter(chunks(WIRE, 3)), cancel)
            .collect()
            .await;
        assert!(tokens.is_empty());
    }
}
