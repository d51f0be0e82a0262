use serde::{Deserialize, Serialize};
use serde_json::Value;

// -- Chat completion request ------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub n: u32,
}

// -- Streamed chunk ---------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub delta: ChatDelta,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

/// Text delta carried by one decoded stream payload.
///
/// Payloads of another shape, an empty `choices` list or a delta without
/// content all yield `None`.
pub fn delta_text(payload: &Value) -> Option<String> {
    let chunk = ChatChunk::deserialize(payload).ok()?;
    chunk.choices.into_iter().next()?.delta.content
}
