//! OpenAI chat-completion wire types and request normalization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProxyError, Result};

/// Values filled in when the caller leaves a field out.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub model: String,
    pub temperature: f32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: 0.7,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// One message with its content flattened to plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A normalized chat request. Serializes to the upstream request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub stream: bool,
}

impl ChatRequest {
    /// Normalize a raw inbound body.
    ///
    /// Fails when `messages` is missing, empty or not a list of objects.
    pub fn from_value(raw: &Value, defaults: &RequestDefaults) -> Result<Self> {
        let messages = raw
            .get("messages")
            .and_then(Value::as_array)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProxyError::InvalidRequest("not found any message".to_string()))?;

        let messages = messages
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                let msg = msg.as_object().ok_or_else(|| {
                    ProxyError::InvalidRequest(format!("messages[{}] is not an object", i))
                })?;
                Ok(ChatMessage {
                    role: msg
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or("user")
                        .to_string(),
                    content: normalize_content(msg.get("content")),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let model = match raw.get("model") {
            None | Some(Value::Null) => defaults.model.clone(),
            Some(Value::String(m)) if !m.is_empty() => m.clone(),
            Some(_) => {
                return Err(ProxyError::InvalidRequest(
                    "model must be a non-empty string".to_string(),
                ));
            }
        };

        let temperature = raw
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|t| t as f32)
            .unwrap_or(defaults.temperature);

        let stream = raw.get("stream").and_then(Value::as_bool).unwrap_or(false);

        Ok(Self {
            messages,
            model,
            temperature,
            stream,
        })
    }
}

/// Flatten message content to text.
///
/// Strings pass through; a list of parts yields the first part carrying a
/// string `text` field; anything else becomes empty.
pub fn normalize_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .find_map(|part| part.get("text").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

/// `chatcmpl-<unix millis>`
pub fn completion_id() -> String {
    format!("chatcmpl-{}", chrono::Utc::now().timestamp_millis())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Caller-facing streaming chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub content: String,
}

impl StreamChunk {
    /// A chunk carrying one content fragment.
    pub fn content(model: &str, content: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion.chunk".to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: content.into(),
                },
                finish_reason: None,
            }],
        }
    }
}

/// Caller-facing non-streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

impl ChatCompletion {
    pub fn new(model: &str, message: ChatMessage, finish_reason: String, usage: Value) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        }
    }
}
