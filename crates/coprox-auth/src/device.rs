//! OAuth 2.0 device authorization grant (RFC 8628) against GitHub.
//!
//! A [`DeviceAuthFlow`] walks one session through
//! `Init -> CodeIssued -> Polling -> {Succeeded, Denied, Expired}`. It never
//! advances on its own after issuing a code: either the console prompt
//! ([`DeviceAuthFlow::prompt_and_poll`]) or a remote confirm step
//! ([`DeviceAuthFlow::confirm_session`]) triggers polling once the human has
//! entered the code.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::credential::SharedCredentialStore;
use crate::error::{AuthError, Result};

/// Grant type sent while polling the token endpoint.
pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Lifetime of a device code when the server does not say.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 900;

/// Poll interval when the server does not say.
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Interval increase mandated by a `slow_down` answer.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

/// Device flow configuration.
#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    pub client_id: String,
    pub scope: String,
    pub device_code_url: String,
    pub token_url: String,
    /// Timeout for each individual HTTP request.
    pub request_timeout: Duration,
    /// Lower bound on the wait between two polls.
    pub min_poll_interval: Duration,
}

impl Default for DeviceFlowConfig {
    fn default() -> Self {
        Self::github_copilot()
    }
}

impl DeviceFlowConfig {
    /// Device flow config for the Copilot OAuth app on github.com.
    pub fn github_copilot() -> Self {
        Self {
            client_id: "Iv1.b507a08c87ecfe98".to_string(),
            scope: "read:user".to_string(),
            device_code_url: "https://github.com/login/device/code".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            request_timeout: Duration::from_secs(30),
            min_poll_interval: Duration::from_secs(1),
        }
    }

    /// Point both endpoints at another GitHub base URL (GHES or a mock).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        self.device_code_url = format!("{}/login/device/code", base);
        self.token_url = format!("{}/login/oauth/access_token", base);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }
}

// ============================================================================
// Session & state
// ============================================================================

/// A device code issued by the authorization server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(skip, default = "Instant::now")]
    issued_at: Instant,
}

impl DeviceSession {
    /// Rebuild a session from just its device code, with default timing
    /// starting now. Used when the code was issued by another flow instance.
    pub fn resume(device_code: impl Into<String>) -> Self {
        Self {
            device_code: device_code.into(),
            user_code: String::new(),
            verification_uri: String::new(),
            expires_in: DEFAULT_EXPIRES_IN_SECS,
            interval: DEFAULT_INTERVAL_SECS,
            issued_at: Instant::now(),
        }
    }

    /// Instant after which polling gives up.
    ///
    /// An `expires_in` too large to represent falls back to the default lifetime.
    pub fn deadline(&self) -> Instant {
        self.issued_at
            .checked_add(Duration::from_secs(self.expires_in))
            .unwrap_or_else(|| self.issued_at + Duration::from_secs(DEFAULT_EXPIRES_IN_SECS))
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// Where a device flow currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlowState {
    Init,
    CodeIssued,
    Polling,
    Succeeded,
    Denied,
    Expired,
}

impl DeviceFlowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeviceFlowState::Succeeded | DeviceFlowState::Denied | DeviceFlowState::Expired
        )
    }
}

/// Result of the remote confirm step, as returned to the auth UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConfirmOutcome {
    fn from_result(result: Result<String>) -> Self {
        match result {
            Ok(token) => Self {
                success: true,
                token: Some(token),
                error: None,
            },
            Err(e) => Self {
                success: false,
                token: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceCodeRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
}

#[derive(Debug, Serialize)]
struct AccessTokenRequest<'a> {
    client_id: &'a str,
    device_code: &'a str,
    grant_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

// ============================================================================
// DeviceAuthFlow
// ============================================================================

/// One device authorization session.
///
/// Instances are single-use: concurrent users each get their own flow, so no
/// polling state is ever shared.
#[derive(Debug)]
pub struct DeviceAuthFlow {
    client: Client,
    config: DeviceFlowConfig,
    store: SharedCredentialStore,
    state: Mutex<DeviceFlowState>,
}

impl DeviceAuthFlow {
    /// Create a flow that persists the resulting token into `store`.
    pub fn new(config: DeviceFlowConfig, store: SharedCredentialStore) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            store,
            state: Mutex::new(DeviceFlowState::Init),
        })
    }

    /// Current state of the flow.
    pub fn state(&self) -> DeviceFlowState {
        *self.state.lock()
    }

    fn set_state(&self, next: DeviceFlowState) {
        let mut state = self.state.lock();
        tracing::debug!(from = ?*state, to = ?next, "Device flow transition");
        *state = next;
    }

    /// Request a device code and user code from the authorization server.
    pub async fn initiate(&self) -> Result<DeviceSession> {
        if self.state() != DeviceFlowState::Init {
            return Err(AuthError::InvalidRequest(
                "Device flow already initiated".to_string(),
            ));
        }

        match self.request_device_code().await {
            Ok(session) => {
                self.set_state(DeviceFlowState::CodeIssued);
                tracing::info!(
                    user_code = %session.user_code,
                    verification_uri = %session.verification_uri,
                    expires_in = session.expires_in,
                    "Device code issued"
                );
                Ok(session)
            }
            Err(e) => {
                self.set_state(DeviceFlowState::Denied);
                Err(e)
            }
        }
    }

    async fn request_device_code(&self) -> Result<DeviceSession> {
        let response = self
            .client
            .post(&self.config.device_code_url)
            .header(header::ACCEPT, "application/json")
            .json(&DeviceCodeRequest {
                client_id: &self.config.client_id,
                scope: &self.config.scope,
            })
            .send()
            .await
            .map_err(|e| AuthError::DeviceCode(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AuthError::DeviceCode(format!("{}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::DeviceCode(format!("Failed to parse response: {}", e)))
    }

    /// Poll until the user approves, denies, or the code expires.
    ///
    /// On success the token is saved to the credential store before it is
    /// returned. A flow can be polled only once.
    pub async fn poll(&self, session: &DeviceSession) -> Result<String> {
        {
            let mut state = self.state.lock();
            if state.is_terminal() || *state == DeviceFlowState::Polling {
                return Err(AuthError::InvalidRequest(
                    "Device session already consumed".to_string(),
                ));
            }
            *state = DeviceFlowState::Polling;
        }

        let result = match self.poll_until_resolved(session).await {
            Ok(token) => self.store.save(&token).await.map(|()| token),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                self.set_state(DeviceFlowState::Succeeded);
                tracing::info!("Device authorization succeeded");
            }
            Err(AuthError::Expired) => {
                self.set_state(DeviceFlowState::Expired);
                tracing::warn!("Device code expired before authorization");
            }
            Err(e) => {
                self.set_state(DeviceFlowState::Denied);
                tracing::warn!(error = %e, "Device authorization failed");
            }
        }

        result
    }

    async fn poll_until_resolved(&self, session: &DeviceSession) -> Result<String> {
        let deadline = session.deadline();
        let mut interval =
            Duration::from_secs(session.interval).max(self.config.min_poll_interval);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let response = self
                .client
                .post(&self.config.token_url)
                .header(header::ACCEPT, "application/json")
                .json(&AccessTokenRequest {
                    client_id: &self.config.client_id,
                    device_code: &session.device_code,
                    grant_type: DEVICE_GRANT_TYPE,
                })
                .send()
                .await
                .map_err(|e| AuthError::Denied(format!("Token poll failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AuthError::Denied(format!(
                    "Token endpoint returned {}: {}",
                    status, body
                )));
            }

            let body: AccessTokenResponse = response.json().await.map_err(|e| {
                AuthError::Denied(format!("Failed to parse token response: {}", e))
            })?;

            let token = body.access_token.filter(|t| !t.is_empty());
            match (token, body.error.as_deref()) {
                (Some(token), _) => return Ok(token),
                (None, Some("authorization_pending")) => {}
                (None, Some("slow_down")) => {
                    interval = body
                        .interval
                        .map(Duration::from_secs)
                        .unwrap_or(interval.saturating_add(SLOW_DOWN_STEP))
                        .max(self.config.min_poll_interval);
                }
                (None, Some("expired_token")) => return Err(AuthError::Expired),
                (None, Some(other)) => {
                    return Err(AuthError::Denied(
                        body.error_description.unwrap_or_else(|| other.to_string()),
                    ));
                }
                (None, None) => {
                    return Err(AuthError::Denied(
                        "Token response carried neither token nor error".to_string(),
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AuthError::Expired);
            }

            tracing::debug!(
                attempt,
                interval_ms = interval.as_millis() as u64,
                "Authorization pending"
            );
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Remote confirm step for a session this process issued.
    pub async fn confirm_session(&self, session: &DeviceSession) -> ConfirmOutcome {
        ConfirmOutcome::from_result(self.poll(session).await)
    }

    /// Remote confirm step when only the device code is known.
    pub async fn confirm(&self, device_code: &str) -> ConfirmOutcome {
        self.confirm_session(&DeviceSession::resume(device_code))
            .await
    }

    /// Console mode: show the code, wait for the user to answer `y`, then poll.
    ///
    /// Returns `Ok(None)` when the user declines.
    pub async fn prompt_and_poll(&self) -> Result<Option<String>> {
        let session = self.initiate().await?;

        println!(
            "Open {} in your browser and enter the code: {}",
            session.verification_uri, session.user_code
        );
        println!("Press 'y' once you have authorized, any other key to abort");

        let answer = tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            std::io::stdin().read_line(&mut input).map(|_| input)
        })
        .await
        .map_err(|e| AuthError::InvalidRequest(format!("Console prompt failed: {}", e)))?
        .map_err(|e| AuthError::InvalidRequest(format!("Failed to read input: {}", e)))?;

        if !answer.trim().eq_ignore_ascii_case("y") {
            self.set_state(DeviceFlowState::Denied);
            return Ok(None);
        }

        self.poll(&session).await.map(Some)
    }
}

// ============================================================================
// DeviceSessionRegistry
// ============================================================================

/// Device sessions issued by the server, waiting for their confirm step.
#[derive(Debug, Default)]
pub struct DeviceSessionRegistry {
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl DeviceSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly issued session. Expired entries are dropped.
    pub fn insert(&self, session: DeviceSession) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, s| !s.is_expired());
        sessions.insert(session.device_code.clone(), session);
    }

    /// Take a session out of the registry. Each session is handed out once.
    pub fn take(&self, device_code: &str) -> Option<DeviceSession> {
        self.sessions.lock().remove(device_code)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
