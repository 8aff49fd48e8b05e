//! Client for the Copilot chat completions endpoint.
//!
//! Adds the editor headers Copilot expects and authenticates with the
//! exchanged session token.

use std::time::Duration;

use coprox_config::UpstreamSection;
use reqwest::{Client, header};

use crate::chat::ChatRequest;
use crate::error::{ProxyError, Result};

/// Copilot chat completions endpoint.
pub const COPILOT_CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";

/// Editor version header value.
pub const EDITOR_VERSION: &str = "vscode/1.98.0-insider";

/// Editor plugin version header value.
pub const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.25.2025021001";

const OPENAI_INTENT: &str = "conversation-panel";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub chat_url: String,
    /// Bound on a whole non-streaming call. For a streaming call it bounds the
    /// wait for the response headers and then each body read.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub editor_version: String,
    pub editor_plugin_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::github_copilot()
    }
}

impl UpstreamConfig {
    pub fn github_copilot() -> Self {
        Self {
            chat_url: COPILOT_CHAT_URL.to_string(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            editor_version: EDITOR_VERSION.to_string(),
            editor_plugin_version: EDITOR_PLUGIN_VERSION.to_string(),
        }
    }

    pub fn with_chat_url(mut self, url: impl Into<String>) -> Self {
        self.chat_url = url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl From<&UpstreamSection> for UpstreamConfig {
    fn from(section: &UpstreamSection) -> Self {
        Self {
            chat_url: section.chat_url.clone(),
            request_timeout: section.request_timeout(),
            editor_version: section.editor_version.clone(),
            editor_plugin_version: section.editor_plugin_version.clone(),
            ..Self::github_copilot()
        }
    }
}

/// Forwards normalized chat requests to Copilot.
#[derive(Debug, Clone)]
pub struct CopilotClient {
    client: Client,
    config: UpstreamConfig,
}

impl CopilotClient {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        // No whole-request timeout here: it would cut long streams short.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Send `request` and return the response once its status is known good.
    ///
    /// Streaming requests return as soon as headers arrive; the body is left
    /// for the caller to consume.
    pub async fn send(&self, request: &ChatRequest, copilot_token: &str) -> Result<reqwest::Response> {
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };

        let mut builder = self
            .client
            .post(&self.config.chat_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", copilot_token))
            .header(header::ACCEPT, accept)
            .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .header("editor-version", &self.config.editor_version)
            .header("editor-plugin-version", &self.config.editor_plugin_version)
            .header("openai-intent", OPENAI_INTENT)
            .json(request);

        if !request.stream {
            builder = builder.timeout(self.config.request_timeout);
        }

        tracing::debug!(
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "Forwarding chat request"
        );

        let response = tokio::time::timeout(self.config.request_timeout, builder.send())
            .await
            .map_err(|_| {
                ProxyError::Network(format!(
                    "Upstream did not respond within {}s",
                    self.config.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| ProxyError::Network(format!("Failed to forward request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}
