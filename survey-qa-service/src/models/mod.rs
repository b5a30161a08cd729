//! Domain models for the survey QA service.

pub mod prompt;
pub mod run;
pub mod usage;

pub use prompt::{
    Completion, ContentPart, LlmResponse, Message, MessageContent, PromptInput, Role, StreamChunk,
};
pub use run::{RunRequest, RunResponse};
pub use usage::{CallUsage, TokenDetail, UsageRecord, UsageSummary};
