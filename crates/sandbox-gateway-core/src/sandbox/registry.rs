//! Sandbox registry
//!
//! In-memory table of session id → sandbox record. Only the lifecycle manager
//! mutates entries; everyone else reads through `get`/`list`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use super::bootstrap::BootstrapState;
use super::driver::RuntimeHandle;

/// Client-facing identity of a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh, never reused session id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Registry entry exists, runtime provisioning in progress
    Creating,
    /// Runtime reports the sandbox as running
    Running,
    /// Runtime reports the sandbox as not running
    Stopped,
    /// Provisioning failed or termination is in progress
    Terminated,
    /// The sandbox no longer exists in the runtime
    Deleted,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A tracked sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    /// Session id handed to clients
    pub id: SessionId,
    /// Engine handle, known once the runtime has created the sandbox
    pub runtime_handle: Option<RuntimeHandle>,
    /// Current lifecycle status
    pub status: SandboxStatus,
    /// Relay URL clients should connect to
    pub relay_endpoint: String,
    /// Host port bound to the preview port
    pub preview_port: Option<u16>,
    /// Agent injection outcome
    pub bootstrap: BootstrapState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    /// A fresh record in the `creating` state
    #[must_use]
    pub fn creating(id: SessionId, relay_endpoint: String) -> Self {
        Self {
            id,
            runtime_handle: None,
            status: SandboxStatus::Creating,
            relay_endpoint,
            preview_port: None,
            bootstrap: BootstrapState::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Session id → sandbox table
#[derive(Default)]
pub struct SandboxRegistry {
    sandboxes: RwLock<HashMap<SessionId, Sandbox>>,
}

impl SandboxRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one record
    pub async fn get(&self, id: &SessionId) -> Option<Sandbox> {
        let sandboxes = self.sandboxes.read().await;
        sandboxes.get(id).cloned()
    }

    /// Snapshot of all records, oldest first
    pub async fn list(&self) -> Vec<Sandbox> {
        let sandboxes = self.sandboxes.read().await;
        let mut all: Vec<Sandbox> = sandboxes.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Number of tracked sandboxes
    pub async fn len(&self) -> usize {
        self.sandboxes.read().await.len()
    }

    /// Check if registry is empty
    pub async fn is_empty(&self) -> bool {
        self.sandboxes.read().await.is_empty()
    }

    /// Insert a new record. Returns `false` if the id is already tracked.
    pub(crate) async fn insert(&self, sandbox: Sandbox) -> bool {
        let mut sandboxes = self.sandboxes.write().await;
        if sandboxes.contains_key(&sandbox.id) {
            return false;
        }
        sandboxes.insert(sandbox.id.clone(), sandbox);
        true
    }

    /// Apply `update` to a record in place, returning the updated snapshot.
    /// A missing id yields `None`.
    pub(crate) async fn update<F>(&self, id: &SessionId, update: F) -> Option<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes.get_mut(id)?;
        update(sandbox);
        Some(sandbox.clone())
    }

    /// Remove a record
    pub(crate) async fn remove(&self, id: &SessionId) -> Option<Sandbox> {
        let mut sandboxes = self.sandboxes.write().await;
        sandboxes.remove(id)
    }
}
