//! Sandbox lifecycle
//!
//! Runtime driver interface, Docker driver, registry, bootstrap injection and
//! the lifecycle manager that ties them together.

pub mod bootstrap;
pub mod docker;
pub mod driver;
pub mod manager;
pub mod registry;

use thiserror::Error;

pub use bootstrap::{BootstrapFailure, BootstrapInjector, BootstrapPlan, BootstrapState};
pub use docker::DockerDriver;
pub use driver::{DriverError, ExecRequest, RuntimeDriver, RuntimeHandle, SandboxSpec};
pub use manager::LifecycleManager;
pub use registry::{Sandbox, SandboxRegistry, SandboxStatus, SessionId};

/// Errors surfaced by the lifecycle manager
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Sandbox creation failed at the runtime layer
    #[error("Failed to provision sandbox: {0}")]
    Provision(String),
    /// Unknown session id
    #[error("Sandbox not found: {0}")]
    NotFound(SessionId),
    /// Engine call failed on an existing sandbox
    #[error("Runtime error: {0}")]
    Runtime(#[source] DriverError),
    /// Command execution channel failed
    #[error("Exec failed: {0}")]
    Exec(String),
}

impl SandboxError {
    /// Whether this is the benign "already gone" case
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
