//! LLM provider abstractions and implementations.
//!
//! Providers are synchronous: they are driven from blocking worker threads and
//! bridge to async I/O through a runtime handle captured at construction.

pub mod bedrock;
pub mod event_stream;
pub mod mock;

use crate::metering::PricingError;
use crate::models::{LlmResponse, PromptInput, StreamChunk};
use thiserror::Error;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Call was cancelled")]
    Cancelled,

    #[error(transparent)]
    Pricing(#[from] PricingError),
}

/// Lazily produced chunks of a streamed response.
pub type ChunkStream = Box<dyn Iterator<Item = Result<StreamChunk, LlmError>> + Send>;

/// Token counting capability of a model.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> u64;
}

/// A hosted chat model.
pub trait ChatModel: TokenCounter {
    /// Identifier used for routing and pricing.
    fn model_id(&self) -> &str;

    /// Single-shot invocation.
    fn invoke(&self, input: &PromptInput) -> Result<LlmResponse, LlmError>;

    /// Streaming invocation. Chunks are produced as the caller pulls them.
    fn invoke_stream(&self, input: &PromptInput) -> Result<ChunkStream, LlmError>;
}

/// Rough token estimate used when no tokenizer is available: one token per
/// four characters, rounded up.
pub fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
