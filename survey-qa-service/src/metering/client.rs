//! LLM client wrapper that meters tokens and cost per call.

use super::pricing::{PricingError, PricingTable, UsageKind};
use super::store::UsageStore;
use super::tokens::count_prompt_tokens;
use crate::models::{LlmResponse, PromptInput, StreamChunk};
use crate::services::metrics;
use crate::services::providers::{ChatModel, ChunkStream, LlmError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A chat model bound to one call id.
///
/// Every invocation records prompt usage before delegating and completion
/// usage as output is observed, under `(call_id, model_id)` in the shared
/// [`UsageStore`]. Results and errors of the wrapped model pass through
/// unchanged. Prompt usage is not rolled back when the call fails.
#[derive(Clone)]
pub struct MeteredClient {
    inner: Arc<dyn ChatModel>,
    call_id: Arc<str>,
    store: UsageStore,
    pricing: PricingTable,
    cancel: CancellationToken,
}

impl MeteredClient {
    /// Fails when the wrapped model has no registered price.
    pub fn new(
        inner: Arc<dyn ChatModel>,
        call_id: impl Into<String>,
        store: UsageStore,
        pricing: PricingTable,
    ) -> Result<Self, PricingError> {
        pricing.price(inner.model_id())?;

        Ok(Self {
            inner,
            call_id: Arc::from(call_id.into()),
            store,
            pricing,
            cancel: CancellationToken::new(),
        })
    }

    /// Tie this client to a token owned by the caller. Once it is cancelled
    /// new invocations fail with [`LlmError::Cancelled`] and streams stop.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_active(&self) -> Result<(), LlmError> {
        if self.is_cancelled() {
            tracing::debug!(call_id = %self.call_id, "Refusing invocation on cancelled call");
            return Err(LlmError::Cancelled);
        }
        Ok(())
    }

    /// Count and record the prompt side of one invocation. Returns the token count.
    pub fn record_prompt(&self, input: &PromptInput) -> Result<u64, LlmError> {
        let tokens = count_prompt_tokens(self.inner.as_ref(), input);
        self.record(UsageKind::Prompt, tokens)?;
        Ok(tokens)
    }

    /// Count and record completion text. Returns the token count.
    pub fn record_completion(&self, text: &str) -> Result<u64, LlmError> {
        let tokens = self.inner.count_tokens(text);
        self.record(UsageKind::Completion, tokens)?;
        Ok(tokens)
    }

    fn record(&self, kind: UsageKind, tokens: u64) -> Result<(), LlmError> {
        let model_id = self.inner.model_id();
        let cost = self.pricing.cost(model_id, tokens, kind)?;

        let landed = match kind {
            UsageKind::Prompt => self.store.record_prompt(&self.call_id, model_id, tokens, cost),
            UsageKind::Completion => {
                self.store
                    .record_completion(&self.call_id, model_id, tokens, cost)
            }
        };

        if landed {
            metrics::record_llm_usage(model_id, kind.as_str(), tokens, cost);
        }

        tracing::trace!(
            call_id = %self.call_id,
            model_id = %model_id,
            kind = kind.as_str(),
            tokens = tokens,
            cost = cost,
            landed = landed,
            "Metered LLM usage"
        );

        Ok(())
    }

    /// Single-shot invocation. Non-text responses count zero completion tokens.
    pub fn invoke(&self, input: &PromptInput) -> Result<LlmResponse, LlmError> {
        self.ensure_active()?;
        self.record_prompt(input)?;

        let response = self.inner.invoke(input)?;

        if let Some(text) = response.as_text() {
            self.record_completion(text)?;
        }

        Ok(response)
    }

    /// Streaming invocation. Prompt usage is recorded before the first chunk;
    /// each text chunk is metered when it is pulled.
    pub fn invoke_stream(&self, input: &PromptInput) -> Result<MeteredStream, LlmError> {
        self.ensure_active()?;
        self.record_prompt(input)?;

        let inner = self.inner.invoke_stream(input)?;

        Ok(MeteredStream {
            inner,
            client: self.clone(),
            done: false,
        })
    }
}

impl std::fmt::Debug for MeteredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredClient")
            .field("call_id", &self.call_id)
            .field("model_id", &self.inner.model_id())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Chunks of a metered streaming call.
pub struct MeteredStream {
    inner: ChunkStream,
    client: MeteredClient,
    done: bool,
}

impl Iterator for MeteredStream {
    type Item = Result<StreamChunk, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.client.is_cancelled() {
            self.done = true;
            return Some(Err(LlmError::Cancelled));
        }

        match self.inner.next()? {
            Ok(StreamChunk::Text(text)) => match self.client.record_completion(&text) {
                Ok(_) => Some(Ok(StreamChunk::Text(text))),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            },
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::mock::MockChatModel;
    use serde_json::json;

    const HAIKU: &str = "anthropic.claude-3-haiku-20240307-v1:0";

    fn client(model: Arc<MockChatModel>, call_id: &str, store: &UsageStore) -> MeteredClient {
        store.open(call_id);
        MeteredClient::new(model, call_id, store.clone(), PricingTable::builtin()).unwrap()
    }

    #[test]
    fn invoke_records_prompt_and_completion() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU).with_reply("one two three four five"));
        let llm = client(model, "A", &store);
        let prompt = PromptInput::text("a b c d e f g h i j");

        let response = llm.invoke(&prompt).unwrap();

        assert_eq!(response.as_text(), Some("one two three four five"));
        let record = store.record("A", HAIKU).unwrap();
        assert_eq!(record.prompt_tokens, 10);
        assert_eq!(record.completion_tokens, 5);
        assert_eq!(record.total_tokens, 15);
        assert_eq!(record.successful_requests, 1);
        let expected = 10.0 / 1000.0 * 0.00025 + 5.0 / 1000.0 * 0.00125;
        assert!((record.total_cost - expected).abs() < 1e-15);
    }

    #[test]
    fn partially_consumed_stream_meters_only_pulled_chunks() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU).with_reply("a b c d e"));
        let llm = client(model, "S", &store);

        let record_after_prompt = {
            let mut stream = llm.invoke_stream(&PromptInput::text("x y")).unwrap();
            let before_first = store.record("S", HAIKU).unwrap();
            assert_eq!(before_first.prompt_tokens, 2);
            assert_eq!(before_first.completion_tokens, 0);

            stream.next().unwrap().unwrap();
            stream.next().unwrap().unwrap();
            store.record("S", HAIKU).unwrap()
        };

        assert_eq!(record_after_prompt.completion_tokens, 2);
        assert_eq!(record_after_prompt.total_tokens, 4);
    }

    #[test]
    fn fully_consumed_stream_meters_every_chunk() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU).with_reply("a b c d e"));
        let llm = client(model, "S", &store);

        let chunks: Vec<_> = llm
            .invoke_stream(&PromptInput::text("x"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(chunks.len(), 6);
        assert_eq!(store.record("S", HAIKU).unwrap().completion_tokens, 5);
    }

    #[test]
    fn failed_call_keeps_prompt_usage() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU).failing("upstream down"));
        let llm = client(model, "E", &store);

        let err = llm.invoke(&PromptInput::text("three word prompt")).unwrap_err();

        assert!(matches!(err, LlmError::ApiError(msg) if msg == "upstream down"));
        let record = store.record("E", HAIKU).unwrap();
        assert_eq!(record.prompt_tokens, 3);
        assert_eq!(record.completion_tokens, 0);
        assert_eq!(record.successful_requests, 1);
    }

    #[test]
    fn structured_response_counts_zero_completion_tokens() {
        let store = UsageStore::new();
        let model = Arc::new(
            MockChatModel::new(HAIKU).with_structured_reply(json!([{ "toolUse": {} }])),
        );
        let llm = client(model, "T", &store);

        let response = llm.invoke(&PromptInput::text("q")).unwrap();

        assert!(response.as_text().is_none());
        assert_eq!(store.record("T", HAIKU).unwrap().completion_tokens, 0);
    }

    #[test]
    fn cancelled_client_fails_fast() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU));
        let token = CancellationToken::new();
        let llm = client(model.clone(), "C", &store).with_cancellation(token.clone());

        token.cancel();

        assert!(llm.is_cancelled());
        assert!(matches!(llm.invoke(&PromptInput::text("q")), Err(LlmError::Cancelled)));
        assert!(matches!(
            llm.invoke_stream(&PromptInput::text("q")),
            Err(LlmError::Cancelled)
        ));
        assert_eq!(model.calls(), 0);
        assert!(store.record("C", HAIKU).is_none());
    }

    #[test]
    fn stream_stops_once_cancelled() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU).with_reply("a b c"));
        let token = CancellationToken::new();
        let llm = client(model, "C", &store).with_cancellation(token.clone());

        let mut stream = llm.invoke_stream(&PromptInput::text("q")).unwrap();
        stream.next().unwrap().unwrap();
        token.cancel();

        assert!(matches!(stream.next(), Some(Err(LlmError::Cancelled))));
        assert!(stream.next().is_none());
        assert_eq!(store.record("C", HAIKU).unwrap().completion_tokens, 1);
    }

    #[test]
    fn unpriced_model_is_rejected_at_construction() {
        let model = Arc::new(MockChatModel::new("vendor.unpriced-v1"));

        let err = MeteredClient::new(model, "X", UsageStore::new(), PricingTable::builtin())
            .unwrap_err();

        assert_eq!(err, PricingError::UnknownModel("vendor.unpriced-v1".to_string()));
    }

    #[test]
    fn writes_after_close_are_dropped_but_call_succeeds() {
        let store = UsageStore::new();
        let model = Arc::new(MockChatModel::new(HAIKU).with_reply("late"));
        let llm = client(model, "L", &store);
        store.close("L");

        let response = llm.invoke(&PromptInput::text("q")).unwrap();

        assert_eq!(response.as_text(), Some("late"));
        assert!(store.is_empty());
    }
}
