//! Prompt token counting over the loose message shapes.

use crate::models::prompt::value_to_text;
use crate::models::{MessageContent, PromptInput};
use crate::services::providers::TokenCounter;

/// Tokens in everything a prompt sends: system text, raw prompt and every
/// message. Transcript parts count their `input` and `output` values
/// separately; unrecognised content is counted as its string form.
pub fn count_prompt_tokens<C: TokenCounter + ?Sized>(counter: &C, input: &PromptInput) -> u64 {
    let mut tokens = 0;

    if let Some(prompt) = &input.prompt {
        tokens += counter.count_tokens(prompt);
    }
    if let Some(system) = &input.system {
        tokens += counter.count_tokens(system);
    }

    for message in &input.messages {
        tokens += count_content_tokens(counter, &message.content);
    }

    tokens
}

pub fn count_content_tokens<C: TokenCounter + ?Sized>(counter: &C, content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => counter.count_tokens(text),
        MessageContent::Parts(parts) => parts
            .iter()
            .flat_map(|part| [part.input.as_ref(), part.output.as_ref()])
            .flatten()
            .map(|value| counter.count_tokens(&value_to_text(value)))
            .sum(),
        MessageContent::Other(value) => {
            let text = value_to_text(value);
            tracing::warn!(
                content = %text,
                "Unrecognised message content, counting it as a string"
            );
            counter.count_tokens(&text)
        }
    }
}
