//! Configuration and settings management
//!
//! Loads gateway settings from config files and environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// Sandbox defaults
/// Base image every sandbox is created from
pub const SANDBOX_IMAGE: &str = "alpine:3.20";
/// Port inside the sandbox that is published on an ephemeral host port
pub const SANDBOX_PREVIEW_PORT: u16 = 3000;
/// Working directory for commands executed inside the sandbox
pub const SANDBOX_WORKDIR: &str = "/app";
/// Memory limit for sandbox container (1GB)
pub const SANDBOX_MEMORY_LIMIT: i64 = 1024 * 1024 * 1024;
/// CPU period for sandbox container
pub const SANDBOX_CPU_PERIOD: i64 = 100_000;
/// CPU quota for sandbox container (2 CPUs)
pub const SANDBOX_CPU_QUOTA: i64 = 200_000;

// Bootstrap defaults
/// Where the agent program is written inside the sandbox
pub const AGENT_INSTALL_PATH: &str = "/opt/sandbox/agent";
/// Log file the detached agent writes to
pub const AGENT_LOG_PATH: &str = "/opt/sandbox/agent.log";
/// Delay between starting the agent and the diagnostic exec
pub const BOOTSTRAP_SETTLE_MS: u64 = 2000;

/// Gateway settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewaySettings {
    /// Address the HTTP and relay listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL of the relay as seen by viewer clients
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Relay URL handed to sandboxes so the agent can dial back
    #[serde(default = "default_agent_relay_url")]
    pub agent_relay_url: String,

    /// Image sandboxes are created from
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,
    /// Preview port inside the sandbox
    #[serde(default = "default_preview_port")]
    pub preview_port: u16,
    /// Working directory inside the sandbox
    #[serde(default = "default_sandbox_workdir")]
    pub sandbox_workdir: String,
    /// Memory limit in bytes
    #[serde(default = "default_memory_limit")]
    pub sandbox_memory_limit: i64,
    /// CPU quota (microseconds per period)
    #[serde(default = "default_cpu_quota")]
    pub sandbox_cpu_quota: i64,
    /// CPU period (microseconds)
    #[serde(default = "default_cpu_period")]
    pub sandbox_cpu_period: i64,

    /// Host path of the agent program injected into every sandbox
    #[serde(default = "default_agent_binary_path")]
    pub agent_binary_path: PathBuf,
    /// Dependency install command run before the agent is written.
    /// An empty string skips the step.
    #[serde(default = "default_install_command")]
    pub bootstrap_install_command: String,
    /// Settle delay before the diagnostic exec, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub bootstrap_settle_ms: u64,
    /// Whether to run the diagnostic exec after starting the agent
    #[serde(default = "default_true")]
    pub bootstrap_diagnostics: bool,

    /// Optional deadline for a single `ExecuteInSandbox` call
    pub exec_timeout_secs: Option<u64>,
    /// Development flag passed into the sandbox environment
    #[serde(default = "default_true")]
    pub dev_mode: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_public_url() -> String {
    "ws://localhost:9001".to_string()
}

fn default_agent_relay_url() -> String {
    "ws://host.docker.internal:9001/relay/agent".to_string()
}

fn default_sandbox_image() -> String {
    SANDBOX_IMAGE.to_string()
}

const fn default_preview_port() -> u16 {
    SANDBOX_PREVIEW_PORT
}

fn default_sandbox_workdir() -> String {
    SANDBOX_WORKDIR.to_string()
}

const fn default_memory_limit() -> i64 {
    SANDBOX_MEMORY_LIMIT
}

const fn default_cpu_quota() -> i64 {
    SANDBOX_CPU_QUOTA
}

const fn default_cpu_period() -> i64 {
    SANDBOX_CPU_PERIOD
}

fn default_agent_binary_path() -> PathBuf {
    PathBuf::from("target/x86_64-unknown-linux-musl/release/sandbox-gateway-agent")
}

fn default_install_command() -> String {
    "apk add --no-cache ca-certificates unzip".to_string()
}

const fn default_settle_ms() -> u64 {
    BOOTSTRAP_SETTLE_MS
}

const fn default_true() -> bool {
    true
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_url: default_public_url(),
            agent_relay_url: default_agent_relay_url(),
            sandbox_image: default_sandbox_image(),
            preview_port: default_preview_port(),
            sandbox_workdir: default_sandbox_workdir(),
            sandbox_memory_limit: default_memory_limit(),
            sandbox_cpu_quota: default_cpu_quota(),
            sandbox_cpu_period: default_cpu_period(),
            agent_binary_path: default_agent_binary_path(),
            bootstrap_install_command: default_install_command(),
            bootstrap_settle_ms: default_settle_ms(),
            bootstrap_diagnostics: true,
            exec_timeout_secs: None,
            dev_mode: true,
        }
    }
}

/// Build the layered configuration source used by every settings struct.
///
/// # Errors
///
/// Returns a `ConfigError` if a present config file cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        // Start off by merging in the "default" configuration file
        .add_source(File::with_name("config/default").required(false))
        // Add in the current environment file
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Local overrides, not checked into git
        .add_source(File::with_name("config/local").required(false))
        // Eg.. `APP__BIND_ADDR=127.0.0.1:9001 ./target/app` sets `bind_addr`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Plain environment variables; empty values are treated as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl GatewaySettings {
    /// Load settings from config files and the environment
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// URL viewer clients connect to for the relay channel
    #[must_use]
    pub fn relay_endpoint(&self) -> String {
        format!("{}/relay", self.public_url.trim_end_matches('/'))
    }

    /// Settle delay before diagnostics as a `Duration`
    #[must_use]
    pub const fn bootstrap_settle(&self) -> Duration {
        Duration::from_millis(self.bootstrap_settle_ms)
    }

    /// Exec deadline, if one is configured
    #[must_use]
    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout_secs.map(Duration::from_secs)
    }
}
