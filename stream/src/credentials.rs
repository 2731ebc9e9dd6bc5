//! Credential sets for the upstream feed
//!
//! Credentials live in an external store and are looked up by name at
//! startup (or "whichever exists" when no name is given). A missing set is
//! not an error: the driver waits for one to appear, heartbeating so the
//! process reads as alive while it waits.

use crate::driver::Shutdown;
use crate::process::ProcessHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{info, warn};
use virta_core::Result;

/// One named credential set for the upstream API
#[derive(Debug, Clone)]
pub struct Credential {
    /// Name the set is looked up by
    pub name: String,
    /// Contact for the owning account
    pub email: Option<String>,
    /// Consumer key
    pub api_key: String,
    /// Consumer secret
    pub api_secret: String,
    /// Access token
    pub access_token: String,
    /// Access token secret
    pub access_token_secret: String,
    /// When the set was stored
    pub created_at: DateTime<Utc>,
}

/// Source of credential sets - external collaborator
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a set by name, or the first stored set when `name` is `None`
    async fn get(&self, name: Option<&str>) -> Result<Option<Credential>>;
}

/// In-memory credential store for tests and single-process deployments
pub struct MemoryCredentialStore {
    credentials: RwLock<Vec<Credential>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(Vec::new()),
        }
    }

    /// Store a credential set
    pub fn insert(&self, credential: Credential) {
        self.credentials.write().push(credential);
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, name: Option<&str>) -> Result<Option<Credential>> {
        let credentials = self.credentials.read();
        Ok(match name {
            Some(name) => credentials.iter().find(|c| c.name == name).cloned(),
            None => credentials.first().cloned(),
        })
    }
}

/// Poll the store until a credential set appears
///
/// Heartbeats between polls so observers keep seeing the process as alive.
/// Returns `None` when shutdown was requested before anything turned up.
pub async fn wait_for_credentials(
    store: &dyn CredentialStore,
    name: Option<&str>,
    process: &ProcessHandle,
    interval: Duration,
    shutdown: &Shutdown,
) -> Result<Option<Credential>> {
    loop {
        match store.get(name).await {
            Ok(Some(credential)) => {
                info!(name = %credential.name, "using credentials");
                process.set_credentials(credential.name.clone());
                return Ok(Some(credential));
            }
            Ok(None) => {
                warn!(name = name.unwrap_or("<first>"), "credentials not found; waiting");
            }
            Err(err) => {
                warn!(error = %err, "credential store unavailable; waiting");
            }
        }

        process.heartbeat().await?;
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Convenience for tests and demos
impl Credential {
    /// Build a set with placeholder secrets
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            api_key: String::new(),
            api_secret: String::new(),
            access_token: String::new(),
            access_token_secret: String::new(),
            created_at: Utc::now(),
        }
    }
}
