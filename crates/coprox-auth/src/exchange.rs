//! Short-lived Copilot session tokens, exchanged from the OAuth token.
//!
//! The cache trusts a fixed TTL rather than the expiry the exchange endpoint
//! reports, and single-flights fetches: concurrent callers for the same OAuth
//! token await one shared upstream request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::{Client, header};
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::{AuthError, Result};

/// Copilot token exchange endpoint on github.com.
pub const DEFAULT_EXCHANGE_URL: &str = "https://api.github.com/copilot_internal/v2/token";

/// How long an exchanged token is served from cache (2 hours).
pub const DEFAULT_EXCHANGE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

// ============================================================================
// TokenExchanger
// ============================================================================

/// Turns an OAuth token into a Copilot session token.
#[async_trait]
pub trait TokenExchanger: Send + Sync + std::fmt::Debug {
    async fn exchange(&self, oauth_token: &str) -> Result<String>;
}

/// Shared token exchanger.
pub type SharedTokenExchanger = Arc<dyn TokenExchanger>;

/// Configuration for [`HttpTokenExchanger`].
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_EXCHANGE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("coprox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ExchangeConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: Option<String>,
}

/// Exchanges tokens against the Copilot token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenExchanger {
    client: Client,
    config: ExchangeConfig,
}

impl HttpTokenExchanger {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, oauth_token: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.config.url)
            .header(header::AUTHORIZATION, format!("Bearer {}", oauth_token))
            .header(header::ACCEPT, "application/json")
            .header(header::USER_AGENT, &self.config.user_agent)
            .send()
            .await
            .map_err(|e| AuthError::Network(format!("Token exchange request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AuthError::TokenExchange(format!("{}: {}", status, body)));
        }

        let body: ExchangeResponse = response.json().await.map_err(|e| {
            AuthError::TokenExchange(format!("Failed to parse exchange response: {}", e))
        })?;

        let token = body
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::TokenExchange("Response carried no token".to_string()))?;

        tracing::info!(token = %mask_token(&token), "Copilot token exchanged");
        Ok(token)
    }
}

/// Shorten a secret for log output.
pub fn mask_token(token: &str) -> String {
    match token.char_indices().nth(6) {
        Some((idx, _)) => format!("{}...", &token[..idx]),
        None => "****".to_string(),
    }
}

// ============================================================================
// ExchangeTokenCache
// ============================================================================

type InflightFetch = Shared<BoxFuture<'static, Result<String>>>;

enum Slot {
    Ready { token: String, fetched_at: Instant },
    Pending { generation: u64, fetch: InflightFetch },
}

/// TTL cache of exchanged tokens with single-flight refresh.
pub struct ExchangeTokenCache {
    exchanger: SharedTokenExchanger,
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for ExchangeTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeTokenCache")
            .field("exchanger", &self.exchanger)
            .field("ttl", &self.ttl)
            .field("entries", &self.slots.lock().len())
            .finish()
    }
}

impl ExchangeTokenCache {
    pub fn new(exchanger: SharedTokenExchanger, ttl: Duration) -> Self {
        Self {
            exchanger,
            ttl,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Cache over the Copilot HTTP exchange endpoint.
    pub fn http(config: ExchangeConfig, ttl: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTokenExchanger::new(config)?), ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a valid exchange token for `oauth_token`, fetching if needed.
    ///
    /// Failures are returned to every waiter and never cached.
    pub async fn get(&self, oauth_token: &str) -> Result<String> {
        let (generation, fetch) = {
            let mut slots = self.slots.lock();
            match slots.get(oauth_token) {
                Some(Slot::Ready { token, fetched_at }) if fetched_at.elapsed() < self.ttl => {
                    return Ok(token.clone());
                }
                Some(Slot::Pending { generation, fetch }) => (*generation, fetch.clone()),
                _ => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let exchanger = self.exchanger.clone();
                    let key = oauth_token.to_string();
                    let fetch = async move { exchanger.exchange(&key).await }
                        .boxed()
                        .shared();
                    slots.insert(
                        oauth_token.to_string(),
                        Slot::Pending {
                            generation,
                            fetch: fetch.clone(),
                        },
                    );
                    tracing::debug!(generation, "Starting token exchange");
                    (generation, fetch)
                }
            }
        };

        let result = fetch.await;

        let mut slots = self.slots.lock();
        let owns_slot = matches!(
            slots.get(oauth_token),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if owns_slot {
            match &result {
                Ok(token) => {
                    slots.insert(
                        oauth_token.to_string(),
                        Slot::Ready {
                            token: token.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    slots.remove(oauth_token);
                    tracing::warn!(error = %e, "Token exchange failed");
                }
            }
        }

        result
    }

    /// Drop the cached token for `oauth_token` so the next call refetches.
    pub fn invalidate(&self, oauth_token: &str) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(oauth_token), Some(Slot::Ready { .. })) {
            slots.remove(oauth_token);
        }
    }
}
