//! Ordered credential sources for the GitHub OAuth token.
//!
//! Resolution order:
//! 1. Environment variable (`GH_COPILOT_TOKEN` by default)
//! 2. Durable credential store (`hosts.json`)
//! 3. Device authorization flow
//!
//! The first source that yields a non-empty token wins and later sources are
//! never consulted.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::credential::SharedCredentialStore;
use crate::device::{DeviceAuthFlow, DeviceFlowConfig};
use crate::error::{AuthError, Result};

/// Environment variable read by [`EnvSource::github_copilot`].
pub const DEFAULT_TOKEN_ENV: &str = "GH_COPILOT_TOKEN";

/// Anything that can produce an OAuth token.
#[async_trait]
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Produce a token, or `Ok(None)` to let the next source try.
    async fn get_token(&self) -> Result<Option<String>>;
}

/// Shared credential source.
pub type SharedCredentialSource = Arc<dyn CredentialSource>;

// ============================================================================
// EnvSource
// ============================================================================

/// Reads the token from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvSource {
    var: String,
}

impl EnvSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn github_copilot() -> Self {
        Self::new(DEFAULT_TOKEN_ENV)
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

#[async_trait]
impl CredentialSource for EnvSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_token(&self) -> Result<Option<String>> {
        Ok(std::env::var(&self.var).ok().filter(|t| !t.is_empty()))
    }
}

// ============================================================================
// FileSource
// ============================================================================

/// Reads the token from the credential store.
#[derive(Debug, Clone)]
pub struct FileSource {
    store: SharedCredentialStore,
}

impl FileSource {
    pub fn new(store: SharedCredentialStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_token(&self) -> Result<Option<String>> {
        match self.store.load().await {
            Ok(token) => Ok(token),
            Err(e) => {
                tracing::warn!(
                    location = %self.store.location(),
                    error = %e,
                    "Ignoring unreadable credential store"
                );
                Ok(None)
            }
        }
    }
}

// ============================================================================
// DeviceFlowSource
// ============================================================================

/// How the device-flow source reaches the human.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlowMode {
    /// Prompt on the console and block until the user answers.
    Interactive,
    /// Never block: report that authentication is required.
    Headless,
}

/// Runs the device authorization flow as a last resort.
///
/// Interactive logins are serialized: requests that arrive while a console
/// login is in progress wait for it and then reuse the stored token.
#[derive(Debug, Clone)]
pub struct DeviceFlowSource {
    config: DeviceFlowConfig,
    store: SharedCredentialStore,
    mode: DeviceFlowMode,
    console: Arc<Mutex<()>>,
}

impl DeviceFlowSource {
    pub fn new(
        config: DeviceFlowConfig,
        store: SharedCredentialStore,
        mode: DeviceFlowMode,
    ) -> Self {
        Self {
            config,
            store,
            mode,
            console: Arc::new(Mutex::new(())),
        }
    }

    pub fn mode(&self) -> DeviceFlowMode {
        self.mode
    }

    /// Run `login` unless a login that finished while we waited already
    /// stored a token.
    async fn login_once<F, Fut>(&self, login: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        let _console = self.console.lock().await;

        match self.store.load().await {
            Ok(Some(token)) => {
                tracing::debug!("Reusing token from a concurrent device login");
                return Ok(Some(token));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Credential store unreadable before device login"),
        }

        login().await
    }
}

#[async_trait]
impl CredentialSource for DeviceFlowSource {
    fn name(&self) -> &str {
        "device"
    }

    async fn get_token(&self) -> Result<Option<String>> {
        match self.mode {
            DeviceFlowMode::Headless => Err(AuthError::AuthenticationRequired(
                "open /auth/device to authorize this proxy with GitHub".to_string(),
            )),
            DeviceFlowMode::Interactive => {
                self.login_once(|| async {
                    let flow = DeviceAuthFlow::new(self.config.clone(), self.store.clone())?;
                    flow.prompt_and_poll().await
                })
                .await
            }
        }
    }
}

// ============================================================================
// AuthResolver
// ============================================================================

/// Short-circuiting chain of credential sources.
#[derive(Debug, Clone)]
pub struct AuthResolver {
    sources: Vec<SharedCredentialSource>,
}

impl AuthResolver {
    /// Build a resolver over sources in priority order.
    pub fn new(sources: Vec<SharedCredentialSource>) -> Self {
        Self { sources }
    }

    /// The standard env → file → device chain.
    pub fn standard(
        token_env: &str,
        store: SharedCredentialStore,
        device_config: DeviceFlowConfig,
        mode: DeviceFlowMode,
    ) -> Self {
        let env: SharedCredentialSource = Arc::new(EnvSource::new(token_env));
        let file: SharedCredentialSource = Arc::new(FileSource::new(store.clone()));
        let device: SharedCredentialSource =
            Arc::new(DeviceFlowSource::new(device_config, store, mode));
        Self::new(vec![env, file, device])
    }

    /// Names of the configured sources, in order.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Return the first non-empty token.
    pub async fn resolve(&self) -> Result<String> {
        for source in &self.sources {
            if let Some(token) = source.get_token().await?.filter(|t| !t.is_empty()) {
                tracing::debug!(source = source.name(), "Resolved OAuth token");
                return Ok(token);
            }
        }

        Err(AuthError::NoCredential)
    }
}
