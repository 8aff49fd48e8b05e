//! Start command - launches the proxy server.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use coprox_auth::{
    AuthResolver, AuthSession, CredentialStore, DeviceFlowMode, ExchangeConfig,
    ExchangeTokenCache,
};
use coprox_proxy::{DeviceLogin, ProxyConfig, ProxyServer};

use super::Context;

/// Arguments for the start command.
///
/// CLI arguments override config file and environment values.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Address to bind to (overrides config and HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Key clients must present on /v1 routes (overrides config)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Prompt for GitHub device login on the console when no token is found
    #[arg(long, conflicts_with = "headless")]
    pub interactive: bool,

    /// Never prompt; clients authorize through /auth/device instead
    #[arg(long)]
    pub headless: bool,
}

impl StartArgs {
    /// The device-flow mode after applying `--interactive`/`--headless`.
    fn mode(&self, configured_headless: bool) -> DeviceFlowMode {
        let headless = if self.interactive {
            false
        } else {
            self.headless || configured_headless
        };
        if headless {
            DeviceFlowMode::Headless
        } else {
            DeviceFlowMode::Interactive
        }
    }
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(key) = &args.api_key {
        config.server.api_key = Some(key.clone()).filter(|k| !k.is_empty());
    }

    let ctx = Context {
        config,
        verbose: ctx.verbose,
    };
    let mode = args.mode(ctx.config.auth.headless);

    let store = ctx.credential_store()?;
    let device_flow = ctx.device_flow_config();
    let resolver = AuthResolver::standard(
        &ctx.config.auth.token_env,
        store.clone(),
        device_flow.clone(),
        mode,
    );

    let exchange_config = ExchangeConfig {
        request_timeout: ctx.config.auth.request_timeout(),
        ..ExchangeConfig::default().with_url(&ctx.config.upstream.token_url)
    };
    let exchange = ExchangeTokenCache::http(exchange_config, ctx.config.upstream.exchange_ttl())?;
    let session = Arc::new(AuthSession::new(resolver, exchange));

    if mode == DeviceFlowMode::Interactive {
        // Settle the login on the console before any client is waiting on it.
        match session.oauth_token().await {
            Ok(_) => tracing::info!("GitHub credential available"),
            Err(e) => eprintln!("warning: no GitHub credential yet: {}", e),
        }
    }

    let proxy_config = ProxyConfig::from_config(&ctx.config);
    println!("coprox listening on http://{}", proxy_config.bind_addr);
    if ctx.verbose {
        println!("  credential sources: {}", session.resolver().source_names().join(" -> "));
        println!("  hosts file: {}", store.location());
        println!("  api key required: {}", proxy_config.api_key.is_some());
    }

    let server = ProxyServer::new(
        proxy_config,
        session,
        DeviceLogin {
            flow: device_flow,
            store,
        },
    )?;
    server.run().await?;

    println!("coprox stopped");
    Ok(())
}
