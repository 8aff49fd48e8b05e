//! Non-streaming completions: one upstream JSON body in, one OpenAI body out.

use serde_json::Value;

use crate::chat::{ChatCompletion, ChatMessage, ChatRequest};
use crate::error::{ProxyError, Result};
use crate::upstream::CopilotClient;

/// Reshape an upstream completion body for a request on `model`.
///
/// Missing fields fall back to an empty assistant message, `"stop"` and an
/// empty usage object.
pub fn reshape(upstream: &Value, model: &str) -> ChatCompletion {
    let choice = upstream.get("choices").and_then(|c| c.get(0));

    let content = choice
        .and_then(|c| c.pointer("/message/content"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .unwrap_or("stop");

    let usage = match upstream.get("usage") {
        Some(usage) if !usage.is_null() => usage.clone(),
        _ => Value::Object(Default::default()),
    };

    ChatCompletion::new(
        model,
        ChatMessage::new("assistant", content),
        finish_reason.to_string(),
        usage,
    )
}

/// Non-streaming chat completions against Copilot.
#[derive(Debug, Clone)]
pub struct AggregateTranslator {
    client: CopilotClient,
}

impl AggregateTranslator {
    pub fn new(client: CopilotClient) -> Self {
        Self { client }
    }

    /// Issue one upstream call and reshape its body.
    pub async fn complete(&self, request: &ChatRequest, copilot_token: &str) -> Result<ChatCompletion> {
        let mut request = request.clone();
        request.stream = false;

        let response = self.client.send(&request, copilot_token).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProxyError::Network(format!("Failed to read response: {}", e)))?;

        let body: Value = serde_json::from_str(&text).map_err(|_| ProxyError::Upstream {
            status: status.as_u16(),
            body: text.clone(),
        })?;

        Ok(reshape(&body, &request.model))
    }
}
