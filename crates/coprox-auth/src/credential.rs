//! Durable storage for the long-lived GitHub OAuth token.
//!
//! Tokens live in the `hosts.json` file shared with other Copilot clients.
//! The file is keyed by host, so entries for other GitHub hosts (and any
//! extra fields other tools keep there) survive our writes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AuthError, Result};

/// File name of the shared Copilot hosts file.
pub const HOSTS_FILE: &str = "hosts.json";

/// Host key used when none is configured.
pub const DEFAULT_HOST: &str = "github.com";

// ============================================================================
// CredentialStore Trait
// ============================================================================

/// Persistence for the OAuth token of a single host.
#[async_trait]
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Load the stored token, if any. Empty tokens count as absent.
    async fn load(&self) -> Result<Option<String>>;

    /// Persist a token, replacing the previous one for this host.
    async fn save(&self, oauth_token: &str) -> Result<()>;

    /// Remove the token for this host.
    async fn delete(&self) -> Result<()>;

    /// Human-readable location, for status output.
    fn location(&self) -> String;
}

/// Shared credential store for use across async contexts.
pub type SharedCredentialStore = Arc<dyn CredentialStore>;

// ============================================================================
// Hosts file format
// ============================================================================

/// One host entry in `hosts.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,

    /// Fields written by other clients (e.g. `user`), kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

type HostsFile = BTreeMap<String, HostEntry>;

/// Platform path of the shared hosts file.
///
/// `~/.config/github-copilot/hosts.json` on Unix-likes (macOS included, to
/// match the other Copilot clients), `%LOCALAPPDATA%\github-copilot\hosts.json`
/// on Windows.
pub fn default_hosts_path() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        dirs::data_local_dir().map(|d| d.join("github-copilot").join(HOSTS_FILE))
    }
    #[cfg(not(windows))]
    {
        dirs::home_dir().map(|d| d.join(".config").join("github-copilot").join(HOSTS_FILE))
    }
}

fn read_hosts(path: &Path) -> Result<HostsFile> {
    if !path.exists() {
        return Ok(HostsFile::new());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| AuthError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
    if content.trim().is_empty() {
        return Ok(HostsFile::new());
    }

    serde_json::from_str(&content).map_err(|e| {
        AuthError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Write the hosts file through a synced temporary sibling and rename it
/// into place, so a failed write never leaves a truncated file behind.
fn write_hosts(path: &Path, hosts: &HostsFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            AuthError::Storage(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let json = serde_json::to_string_pretty(hosts)?;
    let tmp_path = path.with_extension("json.tmp");

    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, path)
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(AuthError::Storage(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }

    Ok(())
}

// ============================================================================
// FileCredentialStore
// ============================================================================

/// File-backed credential store for production use.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    host: String,
    cached_token: RwLock<Option<String>>,
}

impl FileCredentialStore {
    /// Create a store for `host` backed by the file at `path`.
    pub fn new(path: PathBuf, host: impl Into<String>) -> Self {
        Self {
            path,
            host: host.into(),
            cached_token: RwLock::new(None),
        }
    }

    /// Create a store for `github.com` at the platform default path.
    pub fn default_location() -> Result<Self> {
        let path = default_hosts_path().ok_or_else(|| {
            AuthError::Storage("Could not determine home directory".to_string())
        })?;
        Ok(Self::new(path, DEFAULT_HOST))
    }

    /// Get the hosts file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the host key this store reads and writes.
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        {
            let cache = self.cached_token.read().await;
            if cache.is_some() {
                return Ok(cache.clone());
            }
        }

        let hosts = read_hosts(&self.path)?;
        let token = hosts
            .get(&self.host)
            .and_then(|entry| entry.oauth_token.clone())
            .filter(|t| !t.is_empty());

        if let Some(ref t) = token {
            let mut cache = self.cached_token.write().await;
            *cache = Some(t.clone());
        }

        Ok(token)
    }

    async fn save(&self, oauth_token: &str) -> Result<()> {
        // Holding the memo lock serializes writers within this process.
        let mut cache = self.cached_token.write().await;

        let mut hosts = match read_hosts(&self.path) {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Replacing unreadable hosts file");
                HostsFile::new()
            }
        };
        hosts.entry(self.host.clone()).or_default().oauth_token = Some(oauth_token.to_string());

        write_hosts(&self.path, &hosts)?;
        *cache = Some(oauth_token.to_string());

        tracing::info!(host = %self.host, path = %self.path.display(), "OAuth token saved");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut cache = self.cached_token.write().await;
        *cache = None;

        let mut hosts = read_hosts(&self.path)?;
        let removed = hosts
            .get_mut(&self.host)
            .and_then(|entry| entry.oauth_token.take())
            .is_some();
        if hosts.get(&self.host).is_some_and(|e| e.extra.is_empty()) {
            hosts.remove(&self.host);
        }

        if removed {
            write_hosts(&self.path, &hosts)?;
            tracing::info!(host = %self.host, "OAuth token removed");
        }
        Ok(())
    }

    fn location(&self) -> String {
        format!("{} [{}]", self.path.display(), self.host)
    }
}

// ============================================================================
// InMemoryCredentialStore (for testing)
// ============================================================================

/// In-memory credential store for testing.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    token: RwLock<Option<String>>,
    save_count: AtomicU32,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            save_count: AtomicU32::new(0),
        }
    }

    pub fn save_count(&self) -> u32 {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        let token = self.token.read().await;
        Ok(token.clone().filter(|t| !t.is_empty()))
    }

    async fn save(&self, oauth_token: &str) -> Result<()> {
        let mut token = self.token.write().await;
        *token = Some(oauth_token.to_string());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut token = self.token.write().await;
        *token = None;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Create a shared file-backed store.
pub fn create_credential_store(path: PathBuf, host: &str) -> SharedCredentialStore {
    Arc::new(FileCredentialStore::new(path, host))
}

/// Create a shared in-memory store (for testing).
pub fn create_memory_credential_store() -> SharedCredentialStore {
    Arc::new(InMemoryCredentialStore::new())
}
