//! Agent settings, read from the sandbox environment.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Delay between spawning the shell and announcing it as ready
pub const SHELL_READY_DELAY_MS: u64 = 500;
/// Delay before restarting a shell that exited
pub const SHELL_RESTART_DELAY_MS: u64 = 1000;
/// Bound on a single connection attempt
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Settings handed to the agent by the gateway through `SANDBOX_*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Session this sandbox serves (`SANDBOX_SESSION_ID`)
    pub session_id: String,
    /// Relay endpoint to dial (`SANDBOX_RELAY_URL`)
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Development flag (`SANDBOX_DEV_MODE`)
    #[serde(default)]
    pub dev_mode: bool,
    /// Root that file writes and archive extraction are confined to
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Shell program started in interactive mode
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_relay_url() -> String {
    "ws://host.docker.internal:9001/relay/agent".to_string()
}

fn default_work_root() -> PathBuf {
    PathBuf::from("/app")
}

fn default_shell() -> String {
    "sh".to_string()
}

impl AgentSettings {
    /// Load settings from `SANDBOX_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if `SANDBOX_SESSION_ID` is missing or a value
    /// cannot be parsed.
    pub fn new() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                Environment::with_prefix("SANDBOX")
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Bound on one connection attempt
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(CONNECT_TIMEOUT_SECS)
    }
}
