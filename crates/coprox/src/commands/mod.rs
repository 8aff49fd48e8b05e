//! CLI command handlers.

pub mod auth;
pub mod start;

use std::path::Path;

use anyhow::Result;
use coprox_auth::credential::{create_credential_store, default_hosts_path};
use coprox_auth::{DeviceFlowConfig, SharedCredentialStore};
use coprox_config::CoproxConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Effective configuration (files, then environment).
    pub config: CoproxConfig,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Load configuration from `config_path`, or from the discovered layers.
    pub fn load(config_path: Option<&Path>, verbose: bool) -> Result<Self> {
        let config = match config_path {
            Some(path) => {
                let mut config = coprox_config::load_config_file(path)?;
                config.apply_env()?;
                config.validate()?;
                tracing::debug!(path = %path.display(), "Loaded config file");
                config
            }
            None => {
                let loaded = coprox_config::load_config(None)?;
                for warning in &loaded.warnings {
                    eprintln!("warning: {}", warning);
                }
                for path in loaded.loaded_from() {
                    tracing::debug!(path = %path.display(), "Loaded config layer");
                }
                loaded.config
            }
        };

        Ok(Self { config, verbose })
    }

    /// The `hosts.json` store for the configured GitHub host.
    pub fn credential_store(&self) -> Result<SharedCredentialStore> {
        let auth = &self.config.auth;
        let path = match &auth.hosts_file {
            Some(path) => path.clone(),
            None => default_hosts_path()
                .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?,
        };
        Ok(create_credential_store(path, &auth.host))
    }

    /// Device-flow settings from the `[auth]` section.
    pub fn device_flow_config(&self) -> DeviceFlowConfig {
        let auth = &self.config.auth;
        let mut config = DeviceFlowConfig::github_copilot()
            .with_base_url(&auth.github_url)
            .with_client_id(&auth.client_id);
        config.scope = auth.scope.clone();
        config.request_timeout = auth.request_timeout();
        config
    }
}
