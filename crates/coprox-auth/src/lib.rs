//! GitHub Copilot authentication for the coprox proxy.
//!
//! Turns whatever credentials are available into the short-lived Copilot
//! session token the chat endpoint wants.
//!
//! # Components
//!
//! - [`credential`]: `hosts.json` persistence of the long-lived OAuth token
//! - [`device`]: OAuth device authorization flow (console and remote confirm)
//! - [`resolver`]: env → file → device credential chain
//! - [`exchange`]: single-flight TTL cache of exchanged Copilot tokens
//! - [`session`]: resolver + exchange cache owned together

pub mod credential;
pub mod device;
pub mod error;
pub mod exchange;
pub mod resolver;
pub mod session;

#[cfg(test)]
mod test_support;

pub use credential::{
    CredentialStore, FileCredentialStore, InMemoryCredentialStore, SharedCredentialStore,
};
pub use device::{
    ConfirmOutcome, DeviceAuthFlow, DeviceFlowConfig, DeviceFlowState, DeviceSession,
    DeviceSessionRegistry,
};
pub use error::{AuthError, Result};
pub use exchange::{
    ExchangeConfig, ExchangeTokenCache, HttpTokenExchanger, SharedTokenExchanger, TokenExchanger,
};
pub use resolver::{
    AuthResolver, CredentialSource, DeviceFlowMode, DeviceFlowSource, EnvSource, FileSource,
    SharedCredentialSource,
};
pub use session::AuthSession;
