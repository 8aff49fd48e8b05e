//! Per-session pairing of credential resolution and token exchange.

use crate::error::Result;
use crate::exchange::ExchangeTokenCache;
use crate::resolver::AuthResolver;

/// One resolver and the exchange cache it owns.
///
/// Every inbound request goes through [`AuthSession::exchange_token`]: the
/// resolver is cheap on repeat calls (the credential store memoizes) and the
/// cache serves the Copilot token until its TTL runs out.
#[derive(Debug)]
pub struct AuthSession {
    resolver: AuthResolver,
    exchange: ExchangeTokenCache,
}

impl AuthSession {
    pub fn new(resolver: AuthResolver, exchange: ExchangeTokenCache) -> Self {
        Self { resolver, exchange }
    }

    pub fn resolver(&self) -> &AuthResolver {
        &self.resolver
    }

    pub fn exchange_cache(&self) -> &ExchangeTokenCache {
        &self.exchange
    }

    /// Resolve the OAuth token from the configured sources.
    pub async fn oauth_token(&self) -> Result<String> {
        self.resolver.resolve().await
    }

    /// Resolve the OAuth token and return a valid Copilot token for it.
    pub async fn exchange_token(&self) -> Result<String> {
        let oauth_token = self.resolver.resolve().await?;
        self.exchange.get(&oauth_token).await
    }

    /// Forget the cached Copilot token, e.g. after the upstream rejected it.
    pub async fn invalidate(&self) {
        if let Ok(oauth_token) = self.resolver.resolve().await {
            self.exchange.invalidate(&oauth_token);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::credential::InMemoryCredentialStore;
    use crate::error::AuthError;
    use crate::exchange::TokenExchanger;
    use crate::resolver::{FileSource, SharedCredentialSource};

    #[derive(Debug)]
    struct EchoExchanger;

    #[async_trait]
    impl TokenExchanger for EchoExchanger {
        async fn exchange(&self, oauth_token: &str) -> Result<String> {
            Ok(format!("copilot:{}", oauth_token))
        }
    }

    fn session_with(store: Arc<InMemoryCredentialStore>) -> AuthSession {
        AuthSession::new(
            AuthResolver::new(vec![Arc::new(FileSource::new(store)) as SharedCredentialSource]),
            ExchangeTokenCache::new(Arc::new(EchoExchanger), Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn test_exchange_token_uses_resolved_oauth_token() {
        let session = session_with(Arc::new(InMemoryCredentialStore::with_token("gho_1")));
        assert_eq!(session.exchange_token().await.unwrap(), "copilot:gho_1");
    }

    #[tokio::test]
    async fn test_exchange_token_without_credentials() {
        let session = session_with(Arc::new(InMemoryCredentialStore::new()));
        assert_eq!(
            session.exchange_token().await,
            Err(AuthError::NoCredential)
        );
    }
}
