//! Runtime driver interface
//!
//! Abstracts the container engine behind create/start/exec/inspect/stop/remove.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised by a runtime driver
#[derive(Debug, Error)]
pub enum DriverError {
    /// Error returned by the Docker engine
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    /// Local I/O error (e.g. writing exec stdin)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The engine does not know the referenced container
    #[error("Container not found: {0}")]
    NotFound(String),
    /// The engine could not be reached or refused the request
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

/// Engine-facing identity of a sandbox (a container id for Docker)
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RuntimeHandle(String);

impl RuntimeHandle {
    /// Wrap an engine identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw engine identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the driver needs to create one sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Working directory
    pub working_dir: String,
    /// `KEY=value` environment entries
    pub env: Vec<String>,
    /// Labels attached to the container
    pub labels: HashMap<String, String>,
    /// Port inside the sandbox published on an ephemeral host port
    pub preview_port: u16,
    /// Memory limit in bytes
    pub memory_limit: i64,
    /// CPU quota (microseconds per period)
    pub cpu_quota: i64,
    /// CPU period (microseconds)
    pub cpu_period: i64,
}

/// A one-shot command execution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Argument vector
    pub cmd: Vec<String>,
    /// Working directory inside the sandbox
    pub working_dir: Option<String>,
    /// Bytes written to the command's stdin before it is closed
    pub stdin: Option<Bytes>,
}

impl ExecRequest {
    /// Run `command` through `sh -c`
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            cmd: vec!["sh".to_string(), "-c".to_string(), command.into()],
            working_dir: None,
            stdin: None,
        }
    }

    /// Set the working directory
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Attach a stdin payload
    #[must_use]
    pub fn with_stdin(mut self, stdin: Bytes) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// One chunk of exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    /// Standard output bytes
    Stdout(Bytes),
    /// Standard error bytes
    Stderr(Bytes),
}

impl ExecChunk {
    /// Raw bytes regardless of the stream they came from
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        match self {
            Self::Stdout(b) | Self::Stderr(b) => b,
        }
    }
}

/// Output stream of a running exec; ends when the command exits
pub type ExecStream = BoxStream<'static, Result<ExecChunk, DriverError>>;

/// Drain an exec stream into one buffer, stdout and stderr interleaved in
/// arrival order.
///
/// # Errors
///
/// Returns the first error the stream yields.
pub async fn collect_output(mut stream: ExecStream) -> Result<String, DriverError> {
    let mut output = Vec::new();
    while let Some(chunk) = stream.next().await {
        output.extend_from_slice(chunk?.bytes());
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// Observed runtime state of a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Whether the engine reports the sandbox as running
    pub running: bool,
    /// Host port bound to the preview port, once published
    pub preview_host_port: Option<u16>,
}

/// Interface to a container engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Create (but do not start) a sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeHandle, DriverError>;
    /// Start a created sandbox
    async fn start(&self, handle: &RuntimeHandle) -> Result<(), DriverError>;
    /// Open a one-shot execution channel
    async fn exec(
        &self,
        handle: &RuntimeHandle,
        request: ExecRequest,
    ) -> Result<ExecStream, DriverError>;
    /// Inspect the live state of a sandbox
    async fn inspect(&self, handle: &RuntimeHandle) -> Result<RuntimeStatus, DriverError>;
    /// Stop a running sandbox
    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DriverError>;
    /// Remove a sandbox
    async fn remove(&self, handle: &RuntimeHandle) -> Result<(), DriverError>;
}
