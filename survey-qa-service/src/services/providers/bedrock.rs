//! AWS Bedrock provider implementation.
//!
//! Talks to the Bedrock Runtime Converse API with API-key (bearer)
//! authentication. Supports both single-shot and streaming responses.

use super::event_stream::{EventStreamDecoder, Frame};
use super::{approximate_tokens, ChatModel, ChunkStream, LlmError, TokenCounter};
use crate::models::prompt::value_to_text;
use crate::models::{Completion, LlmResponse, MessageContent, PromptInput, Role, StreamChunk};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::runtime::Handle;

/// Bedrock provider configuration.
#[derive(Debug, Clone)]
pub struct BedrockConfig {
    pub region: String,
    pub api_key: String,
    pub model_id: String,
    /// Overrides the regional runtime endpoint.
    pub endpoint: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub request_timeout: Duration,
}

impl BedrockConfig {
    pub fn base_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", self.region))
    }
}

/// Bedrock chat model.
///
/// Calls block on the runtime handle captured at construction, so they must be
/// made from blocking worker threads, never from inside an async task.
pub struct BedrockChatModel {
    config: BedrockConfig,
    client: Client,
    base_url: Url,
    runtime: Handle,
}

impl BedrockChatModel {
    pub fn new(config: BedrockConfig, runtime: Handle) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured(
                "Bedrock API key not configured".to_string(),
            ));
        }

        let base_url = Url::parse(&config.base_url())
            .map_err(|e| LlmError::NotConfigured(format!("invalid Bedrock endpoint: {}", e)))?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            base_url,
            runtime,
        })
    }

    /// Build the API URL for the configured model and action.
    fn api_url(&self, action: &str) -> Result<Url, LlmError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LlmError::NotConfigured("Bedrock endpoint cannot be a base".to_string()))?
            .pop_if_empty()
            .push("model")
            .push(&self.config.model_id)
            .push(action);
        Ok(url)
    }

    fn build_request(&self, input: &PromptInput) -> Result<ConverseRequest, LlmError> {
        let mut system = Vec::new();
        if let Some(text) = &input.system {
            system.push(SystemBlock { text: text.clone() });
        }

        let mut messages: Vec<ConverseMessage> = Vec::new();
        // Converse requires alternating roles; consecutive turns are folded together.
        let mut append = |role: &str, text: String| {
            let block = json!({ "text": text });
            if let Some(last) = messages.last_mut().filter(|m| m.role == role) {
                last.content.push(block);
            } else {
                messages.push(ConverseMessage {
                    role: role.to_string(),
                    content: vec![block],
                });
            }
        };

        for message in &input.messages {
            let text = content_to_text(&message.content);
            match message.role {
                Role::System => system.push(SystemBlock { text }),
                Role::User => append("user", text),
                Role::Assistant => append("assistant", text),
            }
        }
        if let Some(prompt) = &input.prompt {
            append("user", prompt.clone());
        }

        if messages.is_empty() {
            return Err(LlmError::InvalidRequest(
                "a Bedrock conversation needs at least one user message".to_string(),
            ));
        }

        Ok(ConverseRequest {
            messages,
            system,
            inference_config: Some(InferenceConfig {
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            }),
        })
    }

    async fn send(&self, action: &str, request: &ConverseRequest) -> Result<reqwest::Response, LlmError> {
        let url = self.api_url(action)?;

        tracing::debug!(
            model = %self.config.model_id,
            action = action,
            messages = request.messages.len(),
            "Sending request to Bedrock"
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited);
            }

            return Err(LlmError::ApiError(format!(
                "Bedrock API error {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }

    async fn converse(&self, request: ConverseRequest) -> Result<LlmResponse, LlmError> {
        let api_response: ConverseResponse = self
            .send("converse", &request)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let blocks = api_response
            .output
            .message
            .map(|m| m.content)
            .unwrap_or_default();

        let texts: Vec<&str> = blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();

        let content = if texts.is_empty() {
            Completion::Structured(Value::Array(blocks.clone()))
        } else {
            Completion::Text(texts.concat())
        };

        Ok(LlmResponse {
            content,
            stop_reason: api_response.stop_reason,
        })
    }
}

impl TokenCounter for BedrockChatModel {
    fn count_tokens(&self, text: &str) -> u64 {
        approximate_tokens(text)
    }
}

impl ChatModel for BedrockChatModel {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn invoke(&self, input: &PromptInput) -> Result<LlmResponse, LlmError> {
        let request = self.build_request(input)?;
        self.runtime.block_on(self.converse(request))
    }

    fn invoke_stream(&self, input: &PromptInput) -> Result<ChunkStream, LlmError> {
        let request = self.build_request(input)?;
        let response = self
            .runtime
            .block_on(self.send("converse-stream", &request))?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(Box::new(BedrockStream {
            runtime: self.runtime.clone(),
            body,
            decoder: EventStreamDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        }))
    }
}

fn content_to_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| {
                let mut lines = Vec::new();
                if let Some(input) = &part.input {
                    lines.push(format!("Input: {}", value_to_text(input)));
                }
                if let Some(output) = &part.output {
                    lines.push(format!("Output: {}", value_to_text(output)));
                }
                lines.join("\n")
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        MessageContent::Other(value) => value_to_text(value),
    }
}

/// Blocking iterator over a `converse-stream` response body.
struct BedrockStream {
    runtime: Handle,
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: EventStreamDecoder,
    pending: VecDeque<Result<StreamChunk, LlmError>>,
    finished: bool,
}

impl BedrockStream {
    fn drain_frames(&mut self) {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(item) = chunk_from_frame(&frame) {
                        if item.is_err() {
                            self.finished = true;
                        }
                        self.pending.push_back(item);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.finished = true;
                    self.pending.push_back(Err(e));
                    break;
                }
            }
        }
    }
}

impl Iterator for BedrockStream {
    type Item = Result<StreamChunk, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }

            match self.runtime.block_on(self.body.next()) {
                Some(Ok(bytes)) => {
                    self.decoder.push(&bytes);
                    self.drain_frames();
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(LlmError::NetworkError(e.to_string())));
                }
                None => {
                    self.finished = true;
                    if self.decoder.pending() > 0 {
                        return Some(Err(LlmError::StreamError(
                            "stream ended in the middle of a frame".to_string(),
                        )));
                    }
                }
            }
        }
    }
}

/// Map one event stream frame to a chunk. Events that carry no text are skipped.
fn chunk_from_frame(frame: &Frame) -> Option<Result<StreamChunk, LlmError>> {
    let payload: Value = match serde_json::from_slice(&frame.payload) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(LlmError::InvalidResponse(format!(
                "Failed to parse stream event: {}",
                e
            ))))
        }
    };

    if frame.message_type() == Some("exception") {
        let kind = frame.exception_type().unwrap_or("exception");
        if kind == "throttlingException" {
            return Some(Err(LlmError::RateLimited));
        }
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Some(Err(LlmError::ApiError(format!("{}: {}", kind, message))));
    }

    match frame.event_type() {
        Some("contentBlockDelta") => payload
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .map(|text| Ok(StreamChunk::Text(text.to_string()))),
        Some("messageStop") => Some(Ok(StreamChunk::Stop {
            reason: payload
                .get("stopReason")
                .and_then(Value::as_str)
                .unwrap_or("end_turn")
                .to_string(),
        })),
        _ => None,
    }
}

// ============================================================================
// Converse API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest {
    messages: Vec<ConverseMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_config: Option<InferenceConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConverseMessage {
    role: String,
    content: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    #[serde(default)]
    message: Option<ConverseMessage>,
}
