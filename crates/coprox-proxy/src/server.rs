//! HTTP front end.
//!
//! Accepts OpenAI chat-completion requests, authenticates them against
//! Copilot through the [`AuthSession`] and answers with either an SSE stream
//! or a single JSON body. Also exposes the device-flow login endpoints used
//! when the proxy runs headless.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use coprox_auth::{
    AuthSession, DeviceAuthFlow, DeviceFlowConfig, DeviceSession, DeviceSessionRegistry,
    SharedCredentialStore,
};
use coprox_config::CoproxConfig;
use futures::StreamExt;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::aggregate::AggregateTranslator;
use crate::chat::{ChatRequest, RequestDefaults};
use crate::error::{ProxyError, Result, error_body};
use crate::stream::StreamTranslator;
use crate::upstream::{CopilotClient, UpstreamConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `host:port` to listen on.
    pub bind_addr: String,
    pub enable_cors: bool,
    /// Key callers must present on `/v1/*`. `None` leaves the API open.
    pub api_key: Option<String>,
    pub defaults: RequestDefaults,
    /// Model ids listed by `/v1/models`.
    pub models: Vec<String>,
    pub upstream: UpstreamConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from_config(&CoproxConfig::default())
    }
}

impl ProxyConfig {
    pub fn from_config(config: &CoproxConfig) -> Self {
        Self {
            bind_addr: config.server.bind_address(),
            enable_cors: config.server.cors,
            api_key: config.server.api_key.clone(),
            defaults: RequestDefaults {
                model: config.upstream.default_model.clone(),
                temperature: config.upstream.default_temperature,
            },
            models: config.upstream.models.clone(),
            upstream: UpstreamConfig::from(&config.upstream),
        }
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }
}

/// What the device-flow endpoints need to start a login.
#[derive(Debug, Clone)]
pub struct DeviceLogin {
    pub flow: DeviceFlowConfig,
    pub store: SharedCredentialStore,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state for the proxy server.
#[derive(Debug)]
struct ProxyState {
    config: ProxyConfig,
    auth: Arc<AuthSession>,
    device: DeviceLogin,
    pending_devices: DeviceSessionRegistry,
    streams: StreamTranslator,
    aggregates: AggregateTranslator,
}

impl ProxyState {
    /// Drop the cached Copilot token when the chat endpoint refused it.
    async fn forget_rejected_token(&self, err: &ProxyError) {
        if let ProxyError::Upstream { status: 401, .. } = err {
            tracing::info!("Upstream rejected the Copilot token, invalidating cache");
            self.auth.invalidate().await;
        }
    }
}

/// The Copilot proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, auth: Arc<AuthSession>, device: DeviceLogin) -> Result<Self> {
        let client = CopilotClient::new(config.upstream.clone())?;

        Ok(Self {
            state: Arc::new(ProxyState {
                config: config.clone(),
                auth,
                device,
                pending_devices: DeviceSessionRegistry::new(),
                streams: StreamTranslator::new(client.clone()),
                aggregates: AggregateTranslator::new(client),
            }),
            config,
        })
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/v1/chat/completions", post(handle_chat_completions))
            .route("/v1/models", get(handle_models))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_api_key,
            ));

        let mut router = Router::new()
            .route("/", get(handle_root))
            .route("/health", get(handle_health))
            .route("/auth/device", get(handle_device_start))
            .route("/auth/confirm/{device_code}", post(handle_device_confirm))
            .merge(api)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        router
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Starting Copilot proxy");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
            })
            .await
    }

    /// Serve in the background until `shutdown` resolves, returning the bound address.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Starting Copilot proxy");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, self.router())
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Proxy server stopped");
            }
        });
        Ok(local_addr)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API key
// ─────────────────────────────────────────────────────────────────────────────

/// Compare two strings in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Whether an `Authorization` value carries `expected`, raw or as a bearer token.
pub fn api_key_matches(presented: &str, expected: &str) -> bool {
    let presented = presented.trim();
    let bearer = presented.strip_prefix("Bearer ").unwrap_or(presented);
    constant_time_eq(presented, expected) | constant_time_eq(bearer, expected)
}

async fn require_api_key(
    State(state): State<Arc<ProxyState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.api_key {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !api_key_matches(presented, expected) {
            tracing::warn!(path = %request.uri().path(), "Rejected request with invalid API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(error_body("invalid token", "invalid_request_error")),
            )
                .into_response();
        }
    }

    next.run(request).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Handle POST /v1/chat/completions
async fn handle_chat_completions(
    State(state): State<Arc<ProxyState>>,
    body: String,
) -> std::result::Result<Response, ProxyError> {
    let raw: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid JSON: {}", e)))?;
    let request = ChatRequest::from_value(&raw, &state.config.defaults)?;

    let copilot_token = state.auth.exchange_token().await?;

    if request.stream {
        let frames = match state.streams.open(&request, &copilot_token).await {
            Ok(frames) => frames,
            Err(e) => {
                state.forget_rejected_token(&e).await;
                return Err(e);
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(frames.map(Ok::<_, Infallible>)))
            .map_err(|e| ProxyError::Internal(format!("Failed to build response: {}", e)))
    } else {
        match state.aggregates.complete(&request, &copilot_token).await {
            Ok(completion) => Ok(Json(completion).into_response()),
            Err(e) => {
                state.forget_rejected_token(&e).await;
                Err(e)
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelList<'a> {
    object: &'static str,
    data: Vec<ModelEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ModelEntry<'a> {
    id: &'a str,
    object: &'static str,
}

/// Handle GET /v1/models
async fn handle_models(State(state): State<Arc<ProxyState>>) -> Response {
    let list = ModelList {
        object: "list",
        data: state
            .config
            .models
            .iter()
            .map(|id| ModelEntry { id, object: "model" })
            .collect(),
    };
    Json(list).into_response()
}

/// Handle GET /auth/device
async fn handle_device_start(
    State(state): State<Arc<ProxyState>>,
) -> std::result::Result<Json<DeviceSession>, ProxyError> {
    let flow = DeviceAuthFlow::new(state.device.flow.clone(), state.device.store.clone())?;
    let session = flow.initiate().await?;
    state.pending_devices.insert(session.clone());
    Ok(Json(session))
}

/// Handle POST /auth/confirm/{device_code}
async fn handle_device_confirm(
    State(state): State<Arc<ProxyState>>,
    Path(device_code): Path<String>,
) -> std::result::Result<Response, ProxyError> {
    let session = state
        .pending_devices
        .take(&device_code)
        .unwrap_or_else(|| DeviceSession::resume(&device_code));

    let flow = DeviceAuthFlow::new(state.device.flow.clone(), state.device.store.clone())?;
    let outcome = flow.confirm_session(&session).await;

    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    };
    Ok((status, Json(outcome)).into_response())
}

/// Handle GET /
async fn handle_root() -> Redirect {
    Redirect::temporary("/auth/device")
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "coprox"
    }))
}
