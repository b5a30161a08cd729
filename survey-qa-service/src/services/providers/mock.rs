//! Mock provider implementation for testing and local runs.

use super::{ChatModel, ChunkStream, LlmError, TokenCounter};
use crate::models::{Completion, LlmResponse, MessageContent, PromptInput, StreamChunk};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Deterministic chat model.
///
/// Replies come from a script first, then from a fixed default (or an echo of
/// the prompt). Tokens are whitespace-separated words, which keeps accounting
/// in tests exact.
pub struct MockChatModel {
    model_id: String,
    script: Mutex<VecDeque<Completion>>,
    default_reply: Option<String>,
    delay: Duration,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl MockChatModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            script: Mutex::new(VecDeque::new()),
            default_reply: None,
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Reply used once the script is exhausted.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = Some(reply.into());
        self
    }

    /// Replies handed out in order, one per invocation.
    pub fn with_script<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_script(replies.into_iter().map(|r| Completion::Text(r.into())));
        self
    }

    /// Queue a non-text reply.
    pub fn with_structured_reply(self, value: Value) -> Self {
        self.push_script([Completion::Structured(value)]);
        self
    }

    /// Block the calling thread this long on every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every invocation with an API error.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push_script(&self, replies: impl IntoIterator<Item = Completion>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(replies);
        }
    }

    fn next_completion(&self, input: &PromptInput) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        if let Some(message) = &self.failure {
            return Err(LlmError::ApiError(message.clone()));
        }

        let scripted = self
            .script
            .lock()
            .map_err(|_| LlmError::NotConfigured("mock script lock poisoned".to_string()))?
            .pop_front();

        Ok(scripted.unwrap_or_else(|| {
            Completion::Text(
                self.default_reply
                    .clone()
                    .unwrap_or_else(|| format!("Mock response for: {}", last_user_text(input))),
            )
        }))
    }
}

fn last_user_text(input: &PromptInput) -> String {
    input
        .messages
        .iter()
        .rev()
        .find_map(|m| match &m.content {
            MessageContent::Text(text) => Some(text.clone()),
            _ => None,
        })
        .or_else(|| input.prompt.clone())
        .unwrap_or_default()
}

impl TokenCounter for MockChatModel {
    fn count_tokens(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

impl ChatModel for MockChatModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn invoke(&self, input: &PromptInput) -> Result<LlmResponse, LlmError> {
        let content = self.next_completion(input)?;
        Ok(LlmResponse {
            content,
            stop_reason: Some("end_turn".to_string()),
        })
    }

    fn invoke_stream(&self, input: &PromptInput) -> Result<ChunkStream, LlmError> {
        let text = match self.next_completion(input)? {
            Completion::Text(text) => text,
            Completion::Structured(_) => String::new(),
        };

        let mut chunks: Vec<Result<StreamChunk, LlmError>> = text
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::Text(word.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Stop {
            reason: "end_turn".to_string(),
        }));

        Ok(Box::new(chunks.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_default() {
        let model = MockChatModel::new("m")
            .with_script(["first", "second"])
            .with_reply("fallback");
        let input = PromptInput::text("q");

        assert_eq!(model.invoke(&input).unwrap().as_text(), Some("first"));
        assert_eq!(model.invoke(&input).unwrap().as_text(), Some("second"));
        assert_eq!(model.invoke(&input).unwrap().as_text(), Some("fallback"));
        assert_eq!(model.calls(), 3);
    }

    #[test]
    fn echoes_prompt_without_reply() {
        let model = MockChatModel::new("m");

        let response = model.invoke(&PromptInput::text("how many")).unwrap();

        assert_eq!(response.as_text(), Some("Mock response for: how many"));
    }

    #[test]
    fn stream_splits_reply_into_words() {
        let model = MockChatModel::new("m").with_reply("one two three");

        let chunks: Vec<_> = model
            .invoke_stream(&PromptInput::text("q"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("one ".to_string()),
                StreamChunk::Text("two ".to_string()),
                StreamChunk::Text("three".to_string()),
                StreamChunk::Stop {
                    reason: "end_turn".to_string()
                },
            ]
        );
    }

    #[test]
    fn failing_model_returns_api_error() {
        let model = MockChatModel::new("m").failing("throttled upstream");

        let err = model.invoke(&PromptInput::text("q")).unwrap_err();

        assert!(matches!(err, LlmError::ApiError(msg) if msg == "throttled upstream"));
    }
}
