//! Auth command - GitHub credential management.

use anyhow::Result;
use clap::{Args, Subcommand};
use coprox_auth::exchange::mask_token;
use coprox_auth::{
    CredentialStore, DeviceAuthFlow, ExchangeConfig, HttpTokenExchanger, TokenExchanger,
};

use super::Context;

/// Arguments for the auth command.
#[derive(Args, Debug)]
pub struct AuthArgs {
    #[command(subcommand)]
    pub command: AuthCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Authorize with GitHub via the device flow
    Login,

    /// Show which credential the proxy would use
    Status {
        /// Also exchange the credential for a Copilot token
        #[arg(long)]
        verify: bool,
    },

    /// Remove the stored OAuth token
    Logout,
}

/// Run the auth command.
pub async fn run(args: AuthArgs, ctx: &Context) -> Result<()> {
    match args.command {
        AuthCommand::Login => cmd_login(ctx).await,
        AuthCommand::Status { verify } => cmd_status(verify, ctx).await,
        AuthCommand::Logout => cmd_logout(ctx).await,
    }
}

async fn cmd_login(ctx: &Context) -> Result<()> {
    let store = ctx.credential_store()?;

    if let Some(token) = store.load().await? {
        println!("Already authenticated ({})", mask_token(&token));
        println!("Run 'coprox auth logout' first to re-authenticate.");
        return Ok(());
    }

    println!("GitHub Copilot Device Authorization");
    println!("===================================");
    println!();

    let flow = DeviceAuthFlow::new(ctx.device_flow_config(), store.clone())?;
    match flow.prompt_and_poll().await? {
        Some(token) => {
            println!();
            println!("Authenticated ({})", mask_token(&token));
            println!("Token saved to {}", store.location());
        }
        None => println!("Login aborted."),
    }
    Ok(())
}

async fn cmd_status(verify: bool, ctx: &Context) -> Result<()> {
    let token_env = &ctx.config.auth.token_env;
    let store = ctx.credential_store()?;

    let from_env = std::env::var(token_env).ok().filter(|t| !t.is_empty());
    let from_file = store.load().await?;

    println!("GitHub Copilot Authentication");
    println!("=============================");
    println!();
    match &from_env {
        Some(token) => println!("  {}: {}", token_env, mask_token(token)),
        None => println!("  {}: not set", token_env),
    }
    match &from_file {
        Some(token) => println!("  hosts file: {} ({})", mask_token(token), store.location()),
        None => println!("  hosts file: no token ({})", store.location()),
    }

    let Some(token) = from_env.or(from_file) else {
        println!();
        println!("Not authenticated. Run 'coprox auth login' to authorize.");
        return Ok(());
    };

    if verify {
        let exchanger = HttpTokenExchanger::new(ExchangeConfig {
            request_timeout: ctx.config.auth.request_timeout(),
            ..ExchangeConfig::default().with_url(&ctx.config.upstream.token_url)
        })?;
        let copilot_token = exchanger
            .exchange(&token)
            .await
            .map_err(|e| anyhow::anyhow!("Copilot token exchange failed: {}", e))?;
        println!();
        println!("  copilot token: {} (exchange ok)", mask_token(&copilot_token));
    }

    Ok(())
}

async fn cmd_logout(ctx: &Context) -> Result<()> {
    let store = ctx.credential_store()?;

    if store.load().await?.is_none() {
        println!("No stored token for {}.", ctx.config.auth.host);
        return Ok(());
    }

    store.delete().await?;
    println!("Logged out. Removed token from {}", store.location());
    if std::env::var(&ctx.config.auth.token_env).is_ok_and(|t| !t.is_empty()) {
        println!(
            "Note: {} is still set and will be used by the proxy.",
            ctx.config.auth.token_env
        );
    }
    Ok(())
}
