//! Common test utilities for integration tests.
//!
//! Runs the proxy in-process against a mock of the GitHub and Copilot
//! endpoints, both bound to ephemeral localhost ports.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use coprox_auth::{
    AuthResolver, AuthSession, CredentialStore, DeviceFlowConfig, DeviceFlowMode,
    ExchangeTokenCache, credential::create_credential_store, exchange::ExchangeConfig,
};
use coprox_proxy::{DeviceLogin, ProxyConfig, ProxyServer, UpstreamConfig};
use reqwest::Client;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Environment variable the test resolver reads; never set.
const UNSET_TOKEN_ENV: &str = "COPROX_INTEGRATION_UNSET_TOKEN";

/// The streamed reply of the mock chat endpoint.
pub const MOCK_SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"choices\":[]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
    "data: [DONE]\n\n",
);

/// How the mock upstream behaves.
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Fixed status for every chat call, with this body.
    pub chat_failure: Option<(StatusCode, String)>,
    /// Copilot token the chat endpoint answers 401 for.
    pub rejected_token: Option<String>,
}

/// Observable state of the mock upstream.
#[derive(Debug, Default)]
pub struct MockUpstream {
    options: MockOptions,
    pub exchange_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub last_chat_body: Mutex<Option<Value>>,
    pub last_chat_headers: Mutex<Option<HeaderMap>>,
}

impl MockUpstream {
    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn last_chat_body(&self) -> Option<Value> {
        self.last_chat_body.lock().unwrap().clone()
    }

    pub fn last_chat_header(&self, name: &str) -> Option<String> {
        self.last_chat_headers
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|h| h.get(name))
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }
}

async fn exchange(State(mock): State<Arc<MockUpstream>>, headers: HeaderMap) -> Response {
    let n = mock.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer gho_"));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    Json(json!({"token": format!("copilot-{}", n), "expires_at": 0})).into_response()
}

async fn chat(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    mock.chat_calls.fetch_add(1, Ordering::SeqCst);
    *mock.last_chat_body.lock().unwrap() = Some(body.clone());
    *mock.last_chat_headers.lock().unwrap() = Some(headers.clone());

    if let Some((status, body)) = &mock.options.chat_failure {
        return (*status, body.clone()).into_response();
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Some(rejected) = &mock.options.rejected_token
        && auth == format!("Bearer {}", rejected)
    {
        return (StatusCode::UNAUTHORIZED, "{\"message\":\"token expired\"}").into_response();
    }

    if body["stream"] == json!(true) {
        ([(header::CONTENT_TYPE, "text/event-stream")], MOCK_SSE_BODY).into_response()
    } else {
        Json(json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello from Copilot"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        }))
        .into_response()
    }
}

async fn device_code() -> Json<Value> {
    Json(json!({
        "device_code": "dev-123",
        "user_code": "ABCD-1234",
        "verification_uri": "https://github.com/login/device",
        "expires_in": 900,
        "interval": 1
    }))
}

async fn access_token() -> Json<Value> {
    Json(json!({"access_token": "gho_device", "token_type": "bearer", "scope": "read:user"}))
}

async fn spawn(router: Router) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    Ok(format!("http://{}", addr))
}

/// Start the mock GitHub + Copilot upstream.
pub async fn start_mock(options: MockOptions) -> Result<(String, Arc<MockUpstream>)> {
    let mock = Arc::new(MockUpstream {
        options,
        ..Default::default()
    });

    let router = Router::new()
        .route("/copilot_internal/v2/token", get(exchange))
        .route("/chat/completions", post(chat))
        .route("/login/device/code", post(device_code))
        .route("/login/oauth/access_token", post(access_token))
        .with_state(mock.clone());

    Ok((spawn(router).await?, mock))
}

/// A proxy running in the background.
pub struct TestProxy {
    pub base_url: String,
    pub client: Client,
    pub upstream: Arc<MockUpstream>,
    pub hosts_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestProxy {
    /// Start a proxy whose credential file holds `oauth_token`, if any.
    pub async fn start(
        options: MockOptions,
        oauth_token: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<Self> {
        let (mock_url, upstream) = start_mock(options).await?;

        let temp_dir = TempDir::new()?;
        let hosts_path = temp_dir.path().join("hosts.json");
        let store = create_credential_store(hosts_path.clone(), "github.com");
        if let Some(token) = oauth_token {
            store.save(token).await?;
        }

        let device_flow = DeviceFlowConfig::github_copilot().with_base_url(&mock_url);
        let resolver = AuthResolver::standard(
            UNSET_TOKEN_ENV,
            store.clone(),
            device_flow.clone(),
            DeviceFlowMode::Headless,
        );
        let exchange = ExchangeTokenCache::http(
            ExchangeConfig::default().with_url(format!("{}/copilot_internal/v2/token", mock_url)),
            Duration::from_secs(3600),
        )?;

        let mut config = ProxyConfig::default()
            .with_bind_addr("127.0.0.1:0")
            .with_upstream(
                UpstreamConfig::github_copilot()
                    .with_chat_url(format!("{}/chat/completions", mock_url))
                    .with_request_timeout(Duration::from_secs(10)),
            );
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }

        let server = ProxyServer::new(
            config,
            Arc::new(AuthSession::new(resolver, exchange)),
            DeviceLogin {
                flow: device_flow,
                store,
            },
        )?;
        let addr = server.run_with_shutdown(std::future::pending()).await?;

        Ok(Self {
            base_url: format!("http://{}", addr),
            client: Client::new(),
            upstream,
            hosts_path,
            _temp_dir: temp_dir,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a chat completion body.
    pub async fn chat(&self, body: Value) -> Result<reqwest::Response> {
        Ok(self
            .client
            .post(self.url("/v1/chat/completions"))
            .json(&body)
            .send()
            .await?)
    }
}

/// Extract the `delta.content` strings of a caller-facing SSE body, plus
/// whether it ended with the done marker.
pub fn parse_frames(body: &str) -> (Vec<String>, bool) {
    let mut contents = Vec::new();
    let mut done = false;
    for frame in body.split("\n\n").filter(|f| !f.is_empty()) {
        let payload = frame.strip_prefix("data: ").unwrap_or(frame);
        if payload == "[DONE]" {
            done = true;
            continue;
        }
        let value: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
        if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
            contents.push(content.to_string());
        }
    }
    (contents, done)
}
