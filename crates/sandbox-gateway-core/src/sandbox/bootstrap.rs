//! Bootstrap injector
//!
//! Pushes the agent program into a freshly started sandbox and launches it in
//! the background. Steps never roll back sandbox creation: a failure is logged
//! and recorded on the sandbox as `BootstrapState::Failed`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::driver::{collect_output, ExecRequest, RuntimeDriver, RuntimeHandle};
use super::registry::SessionId;
use crate::config::{GatewaySettings, AGENT_INSTALL_PATH, AGENT_LOG_PATH};

/// A bootstrap step that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapStep {
    /// Installing the agent's runtime dependencies
    Install,
    /// Writing the agent program into the sandbox
    Write,
    /// Starting the agent as a background process
    Start,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Write => "write",
            Self::Start => "start",
        };
        f.write_str(s)
    }
}

/// A failed bootstrap step
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("bootstrap step {step} failed: {reason}")]
pub struct BootstrapFailure {
    /// Step that failed
    pub step: BootstrapStep,
    /// Error text
    pub reason: String,
}

/// Outcome of agent injection, recorded on the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BootstrapState {
    /// Injection has not finished yet
    Pending,
    /// The agent process was launched
    Started,
    /// A step failed; the sandbox stays up without an agent
    Failed(BootstrapFailure),
}

/// Source of the agent program
#[derive(Debug, Clone)]
pub enum AgentProgram {
    /// Read from a host path at injection time
    File(PathBuf),
    /// Already in memory
    Bytes(Bytes),
}

impl AgentProgram {
    async fn load(&self) -> std::io::Result<Bytes> {
        match self {
            Self::File(path) => tokio::fs::read(path).await.map(Bytes::from),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// What to inject and how
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    /// Dependency install command, `None` to skip
    pub install_command: Option<String>,
    /// The agent program
    pub program: AgentProgram,
    /// Path of the agent inside the sandbox
    pub install_path: String,
    /// Log file for the agent's stdout/stderr
    pub log_path: String,
    /// Working directory the agent is started in
    pub working_dir: String,
    /// Delay before the diagnostic exec
    pub settle: Duration,
    /// Whether to run the diagnostic exec at all
    pub diagnostics: bool,
}

impl BootstrapPlan {
    /// Plan derived from gateway settings
    #[must_use]
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        let install_command = Some(settings.bootstrap_install_command.trim())
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string);

        Self {
            install_command,
            program: AgentProgram::File(settings.agent_binary_path.clone()),
            install_path: AGENT_INSTALL_PATH.to_string(),
            log_path: AGENT_LOG_PATH.to_string(),
            working_dir: settings.sandbox_workdir.clone(),
            settle: settings.bootstrap_settle(),
            diagnostics: settings.bootstrap_diagnostics,
        }
    }
}

fn quoted(s: &str) -> Cow<'_, str> {
    shell_escape::escape(Cow::Borrowed(s))
}

/// Injects and starts the in-sandbox agent
pub struct BootstrapInjector {
    driver: Arc<dyn RuntimeDriver>,
    plan: BootstrapPlan,
}

impl BootstrapInjector {
    /// Create an injector that talks to `driver`
    #[must_use]
    pub fn new(driver: Arc<dyn RuntimeDriver>, plan: BootstrapPlan) -> Self {
        Self { driver, plan }
    }

    /// Run every bootstrap step against a started sandbox.
    ///
    /// Never fails: the first failing step is returned as `Failed`. An install
    /// failure does not stop the remaining steps; a write failure skips the start.
    #[instrument(skip_all, fields(session_id = %session_id, container_id = %handle))]
    pub async fn inject(&self, handle: &RuntimeHandle, session_id: &SessionId) -> BootstrapState {
        info!("Setting up sandbox agent");
        let mut first_failure: Option<BootstrapFailure> = None;

        if let Some(install) = &self.plan.install_command {
            info!("Installing agent dependencies");
            if let Err(failure) = self.install(handle, install).await {
                warn!(step = %failure.step, reason = %failure.reason, "Bootstrap step failed");
                first_failure.get_or_insert(failure);
            }
        }

        match self.write_program(handle).await {
            Ok(()) => {
                if let Err(failure) = self.start(handle).await {
                    warn!(step = %failure.step, reason = %failure.reason, "Bootstrap step failed");
                    first_failure.get_or_insert(failure);
                }
            }
            Err(failure) => {
                warn!(step = %failure.step, reason = %failure.reason, "Bootstrap step failed, agent not started");
                first_failure.get_or_insert(failure);
            }
        }

        if self.plan.diagnostics {
            tokio::time::sleep(self.plan.settle).await;
            self.diagnose(handle).await;
        }

        match first_failure {
            Some(failure) => BootstrapState::Failed(failure),
            None => {
                info!("Sandbox agent started");
                BootstrapState::Started
            }
        }
    }

    async fn run(
        &self,
        handle: &RuntimeHandle,
        step: BootstrapStep,
        request: ExecRequest,
    ) -> Result<(), BootstrapFailure> {
        let fail = |reason: String| BootstrapFailure { step, reason };

        let stream = self
            .driver
            .exec(handle, request)
            .await
            .map_err(|e| fail(e.to_string()))?;
        let output = collect_output(stream).await.map_err(|e| fail(e.to_string()))?;

        debug!(step = %step, output = %output, "Exec completed");
        Ok(())
    }

    async fn install(&self, handle: &RuntimeHandle, command: &str) -> Result<(), BootstrapFailure> {
        self.run(handle, BootstrapStep::Install, ExecRequest::shell(command))
            .await
    }

    async fn write_program(&self, handle: &RuntimeHandle) -> Result<(), BootstrapFailure> {
        let program = self.plan.program.load().await.map_err(|e| BootstrapFailure {
            step: BootstrapStep::Write,
            reason: format!("failed to read agent program: {e}"),
        })?;

        let path = quoted(&self.plan.install_path);
        let dir = std::path::Path::new(&self.plan.install_path)
            .parent()
            .map_or_else(|| "/".to_string(), |p| p.to_string_lossy().to_string());

        // The program is streamed through stdin as the body of `cat`
        let command = format!(
            "mkdir -p {} && cat > {path} && chmod +x {path}",
            quoted(&dir)
        );

        debug!(bytes = program.len(), "Writing agent program");
        self.run(
            handle,
            BootstrapStep::Write,
            ExecRequest::shell(command).with_stdin(program),
        )
        .await
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), BootstrapFailure> {
        let command = format!(
            "cd {} && nohup {} > {} 2>&1 & echo \"agent started\"",
            quoted(&self.plan.working_dir),
            quoted(&self.plan.install_path),
            quoted(&self.plan.log_path),
        );

        info!("Starting sandbox agent");
        self.run(handle, BootstrapStep::Start, ExecRequest::shell(command))
            .await
    }

    async fn diagnose(&self, handle: &RuntimeHandle) {
        let command = format!(
            "ps aux | grep -v grep | grep {path} || echo \"Process not found\"; tail -n 50 {log} || echo \"No log file\"",
            path = quoted(&self.plan.install_path),
            log = quoted(&self.plan.log_path),
        );

        let result = match self.driver.exec(handle, ExecRequest::shell(command)).await {
            Ok(stream) => collect_output(stream).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => debug!(output = %output, "Agent diagnostics"),
            Err(e) => debug!(error = %e, "Agent diagnostics unavailable"),
        }
    }
}
