//! Error types for credential resolution and token exchange.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur while obtaining Copilot credentials.
///
/// Payloads are plain strings so the error can be cloned and fanned out to
/// every waiter of a shared token fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credential source produced an OAuth token.
    #[error("No GitHub OAuth token available. Run 'coprox auth login' or open /auth/device")]
    NoCredential,

    /// Interactive authentication is needed but the caller cannot block on it.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// The device-code request was rejected.
    #[error("Device code request failed: {0}")]
    DeviceCode(String),

    /// The user or the authorization server denied the device flow.
    #[error("Device authorization denied: {0}")]
    Denied(String),

    /// The device code expired before the user approved it.
    #[error("Device authorization expired")]
    Expired,

    /// The OAuth token could not be exchanged for a Copilot token.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// Credential file could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AuthError {
    /// Whether this error means the caller is not (or no longer) authenticated.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::NoCredential
                | AuthError::AuthenticationRequired(_)
                | AuthError::TokenExchange(_)
        )
    }

    /// Whether this error came out of the device authorization flow.
    pub fn is_device_flow(&self) -> bool {
        matches!(
            self,
            AuthError::DeviceCode(_) | AuthError::Denied(_) | AuthError::Expired
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Serialization(e.to_string())
    }
}
