//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! api_key = "sk-local"          # optional; guards /v1/*
//!
//! [auth]
//! token_env = "GH_COPILOT_TOKEN"
//! host = "github.com"
//! headless = true
//!
//! [upstream]
//! chat_url = "https://api.githubcopilot.com/chat/completions"
//! exchange_ttl_secs = 7200
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoproxConfig {
    /// HTTP front end.
    pub server: ServerSection,

    /// Credential sources and the device flow.
    pub auth: AuthSection,

    /// Copilot endpoints and request shaping.
    pub upstream: UpstreamSection,
}

impl CoproxConfig {
    /// Config with every default applied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply the process environment on top of file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (`HOST`, `PORT`, `API_KEY`).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            self.server.host = host;
        }

        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "PORT".to_string(),
                message: format!("'{}' is not a valid port", port),
            })?;
        }

        if let Some(key) = lookup("API_KEY") {
            self.server.api_key = Some(key).filter(|k| !k.is_empty());
        }

        Ok(())
    }

    /// Reject values that would make the proxy unusable.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.exchange_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "upstream.exchange_ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.upstream.request_timeout_secs == 0 || self.auth.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_secs".to_string(),
                message: "requests must have a bounded, non-zero timeout".to_string(),
            });
        }
        if self.auth.token_env.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "auth.token_env".to_string(),
                message: "must name an environment variable".to_string(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Key callers must present in `Authorization`. Unset means open.
    pub api_key: Option<String>,
    /// Permissive CORS for browser clients.
    pub cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: None,
            cors: true,
        }
    }
}

impl ServerSection {
    /// `host:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

/// `[auth]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Environment variable checked first for an OAuth token.
    pub token_env: String,
    /// Explicit hosts file; defaults to the shared Copilot location.
    pub hosts_file: Option<PathBuf>,
    /// Key inside the hosts file.
    pub host: String,
    /// GitHub web base URL for the device flow.
    pub github_url: String,
    pub client_id: String,
    pub scope: String,
    /// Server mode: never block a request on the console prompt.
    pub headless: bool,
    pub request_timeout_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_env: "GH_COPILOT_TOKEN".to_string(),
            hosts_file: None,
            host: "github.com".to_string(),
            github_url: "https://github.com".to_string(),
            client_id: "Iv1.b507a08c87ecfe98".to_string(),
            scope: "read:user".to_string(),
            headless: true,
            request_timeout_secs: 30,
        }
    }
}

impl AuthSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream
// ─────────────────────────────────────────────────────────────────────────────

/// `[upstream]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub chat_url: String,
    /// Copilot token exchange endpoint.
    pub token_url: String,
    /// How long an exchanged token is reused.
    pub exchange_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub editor_version: String,
    pub editor_plugin_version: String,
    pub default_model: String,
    pub default_temperature: f32,
    /// Models advertised on `/v1/models`.
    pub models: Vec<String>,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            chat_url: "https://api.githubcopilot.com/chat/completions".to_string(),
            token_url: "https://api.github.com/copilot_internal/v2/token".to_string(),
            exchange_ttl_secs: 2 * 60 * 60,
            request_timeout_secs: 60,
            editor_version: "vscode/1.98.0-insider".to_string(),
            editor_plugin_version: "copilot-chat/0.25.2025021001".to_string(),
            default_model: "gpt-4".to_string(),
            default_temperature: 0.7,
            models: [
                "gpt-4",
                "o3-mini",
                "o1",
                "gemini-2.0-flash-001",
                "claude-3.5-sonnet",
                "claude-3.7-sonnet",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl UpstreamSection {
    pub fn exchange_ttl(&self) -> Duration {
        Duration::from_secs(self.exchange_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
