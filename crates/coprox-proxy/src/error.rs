//! Error types for the proxy and their HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use coprox_auth::AuthError;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Credential resolution, device flow or token exchange failed.
    #[error("{0}")]
    Auth(#[from] AuthError),

    /// Upstream chat endpoint answered with a non-2xx status.
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Upstream could not be reached or the connection broke.
    #[error("Network error: {0}")]
    Network(String),

    /// Caller sent something we cannot forward.
    #[error("{0}")]
    InvalidRequest(String),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialization(err.to_string())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status and OpenAI-style error type for this error.
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::Auth(e) if e.is_unauthenticated() => {
                (StatusCode::UNAUTHORIZED, "auth_error")
            }
            ProxyError::Auth(e) if e.is_device_flow() => {
                (StatusCode::UNAUTHORIZED, "device_flow_error")
            }
            ProxyError::Auth(AuthError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            ProxyError::Auth(AuthError::Network(_)) => (StatusCode::BAD_GATEWAY, "network_error"),
            ProxyError::Auth(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
            ProxyError::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            ProxyError::Network(_) => (StatusCode::BAD_GATEWAY, "network_error"),
            ProxyError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            ProxyError::Serialization(_) | ProxyError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        }
    }
}

/// `{"error": {"message": ..., "type": ...}}`
pub fn error_body(message: &str, error_type: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
        }
    })
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        (status, Json(error_body(&self.to_string(), error_type))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_unauthorized() {
        for err in [
            AuthError::NoCredential,
            AuthError::AuthenticationRequired("login".to_string()),
            AuthError::TokenExchange("401 Unauthorized: bad credentials".to_string()),
        ] {
            let (status, kind) = ProxyError::Auth(err).status_and_type();
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(kind, "auth_error");
        }
    }

    #[test]
    fn test_device_flow_errors() {
        let (status, kind) = ProxyError::Auth(AuthError::Expired).status_and_type();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(kind, "device_flow_error");
    }

    #[test]
    fn test_upstream_error_keeps_body() {
        let err = ProxyError::Upstream {
            status: 503,
            body: "{\"message\":\"overloaded\"}".to_string(),
        };
        assert_eq!(err.status_and_type().0, StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("{\"message\":\"overloaded\"}"));
    }

    #[test]
    fn test_other_statuses() {
        assert_eq!(
            ProxyError::InvalidRequest("x".into()).status_and_type().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Network("x".into()).status_and_type().0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Internal("x".into()).status_and_type().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let response = ProxyError::Auth(AuthError::NoCredential).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "auth_error");
        assert!(body["error"]["message"].as_str().is_some());
    }
}
