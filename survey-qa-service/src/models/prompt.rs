//! LLM input and output shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One part of a tool transcript: what was sent to the tool and what it returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl ContentPart {
    pub fn exchange(input: impl Into<Value>, output: impl Into<Value>) -> Self {
        Self {
            input: Some(input.into()),
            output: Some(output.into()),
        }
    }
}

/// Message content as it arrives from callers.
///
/// Anything that is neither plain text nor a list of transcript parts lands
/// in `Other` and is treated as its string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Other(Value),
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything sent to a model in one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl PromptInput {
    /// A bare prompt with no system text or history.
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }
}

/// Model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    /// Non-text output (tool use blocks and the like), kept verbatim.
    Structured(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: Completion,
    pub stop_reason: Option<String>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Completion::Text(text.into()),
            stop_reason: None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            Completion::Text(text) => Some(text),
            Completion::Structured(_) => None,
        }
    }
}

/// One element of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    Stop { reason: String },
}

/// String form of a transcript value: strings verbatim, anything else as JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_shapes_deserialize_into_variants() {
        let text: MessageContent = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(text, MessageContent::Text("hello".to_string()));

        let parts: MessageContent =
            serde_json::from_value(json!([{ "input": "SELECT 1", "output": 1 }])).unwrap();
        assert_eq!(
            parts,
            MessageContent::Parts(vec![ContentPart::exchange("SELECT 1", 1)])
        );

        let other: MessageContent = serde_json::from_value(json!({ "image": "..." })).unwrap();
        assert!(matches!(other, MessageContent::Other(_)));

        let mixed: MessageContent = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert!(matches!(mixed, MessageContent::Other(_)));
    }

    #[test]
    fn value_to_text_keeps_strings_verbatim() {
        assert_eq!(value_to_text(&json!("plain")), "plain");
        assert_eq!(value_to_text(&json!(42)), "42");
        assert_eq!(value_to_text(&json!({ "a": 1 })), r#"{"a":1}"#);
    }
}
