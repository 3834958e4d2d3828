//! Sandbox lifecycle manager
//!
//! Create / Terminate / GetStatus / ExecuteInSandbox. The manager owns the
//! registry and is the only component that changes a sandbox's status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::bootstrap::{BootstrapInjector, BootstrapPlan};
use super::driver::{
    collect_output, DriverError, ExecRequest, RuntimeDriver, RuntimeHandle, RuntimeStatus,
    SandboxSpec,
};
use super::registry::{Sandbox, SandboxRegistry, SandboxStatus, SessionId};
use super::SandboxError;
use crate::config::GatewaySettings;

/// Label carrying the session id on every sandbox container
pub const SESSION_LABEL: &str = "sandbox-gateway.session";
/// Label marking containers created by the gateway
pub const MANAGED_LABEL: &str = "sandbox-gateway.managed";

/// Orchestrates the runtime driver, bootstrap injector and registry
pub struct LifecycleManager {
    driver: Arc<dyn RuntimeDriver>,
    registry: SandboxRegistry,
    injector: BootstrapInjector,
    settings: GatewaySettings,
    exec_timeout: Option<Duration>,
}

impl LifecycleManager {
    /// Create a manager with a bootstrap plan derived from `settings`
    #[must_use]
    pub fn new(driver: Arc<dyn RuntimeDriver>, settings: GatewaySettings) -> Self {
        let plan = BootstrapPlan::from_settings(&settings);
        let injector = BootstrapInjector::new(driver.clone(), plan);
        let exec_timeout = settings.exec_timeout();
        Self {
            driver,
            registry: SandboxRegistry::new(),
            injector,
            settings,
            exec_timeout,
        }
    }

    /// Replace the bootstrap plan
    #[must_use]
    pub fn with_bootstrap_plan(mut self, plan: BootstrapPlan) -> Self {
        self.injector = BootstrapInjector::new(self.driver.clone(), plan);
        self
    }

    /// Bound every `execute` call by `timeout`
    #[must_use]
    pub const fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = Some(timeout);
        self
    }

    /// Read access to the registry
    #[must_use]
    pub const fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Snapshot of every tracked sandbox
    pub async fn list(&self) -> Vec<Sandbox> {
        self.registry.list().await
    }

    /// Provision a new sandbox and start its agent.
    ///
    /// Bootstrap failures do not fail the call; they are recorded on the
    /// returned record.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Provision` if the runtime cannot create or start
    /// the sandbox. The registry entry is removed in that case.
    #[instrument(skip_all, fields(session_id))]
    pub async fn create(&self) -> Result<Sandbox, SandboxError> {
        let id = SessionId::generate();
        tracing::Span::current().record("session_id", id.as_str());

        let record = Sandbox::creating(id.clone(), self.settings.relay_endpoint());
        if !self.registry.insert(record).await {
            return Err(SandboxError::Provision(format!("session id {id} already in use")));
        }
        info!("Creating sandbox");

        match self.provision(&id).await {
            Ok(sandbox) => {
                info!(
                    preview_port = ?sandbox.preview_port,
                    bootstrap = ?sandbox.bootstrap,
                    "Sandbox running"
                );
                Ok(sandbox)
            }
            Err(e) => {
                self.registry.remove(&id).await;
                warn!(error = %e, "Sandbox provisioning failed");
                Err(e)
            }
        }
    }

    async fn provision(&self, id: &SessionId) -> Result<Sandbox, SandboxError> {
        let spec = self.sandbox_spec(id);
        let handle = self
            .driver
            .create(&spec)
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;

        let mut previous = None;
        self.registry
            .update(id, |s| {
                previous = Some(s.status);
                s.runtime_handle = Some(handle.clone());
            })
            .await;
        if previous != Some(SandboxStatus::Creating) {
            self.discard(&handle).await;
            return Err(terminated_during_provisioning());
        }

        let status = match self.start_and_inspect(&handle).await {
            Ok(status) => status,
            Err(e) => {
                self.discard(&handle).await;
                return Err(SandboxError::Provision(e.to_string()));
            }
        };

        let bootstrap = self.injector.inject(&handle, id).await;

        // Only a record still in `Creating` may become `Running`; a terminate
        // that started meanwhile owns the status and the container.
        let mut previous = None;
        let sandbox = self
            .registry
            .update(id, |s| {
                previous = Some(s.status);
                if s.status == SandboxStatus::Creating {
                    s.status = SandboxStatus::Running;
                    s.preview_port = status.preview_host_port;
                    s.bootstrap = bootstrap;
                }
            })
            .await;
        match sandbox {
            Some(sandbox) if previous == Some(SandboxStatus::Creating) => Ok(sandbox),
            _ => {
                self.discard(&handle).await;
                Err(terminated_during_provisioning())
            }
        }
    }

    async fn start_and_inspect(
        &self,
        handle: &RuntimeHandle,
    ) -> Result<RuntimeStatus, DriverError> {
        self.driver.start(handle).await?;
        self.driver.inspect(handle).await
    }

    /// Best-effort removal of a half-provisioned container
    async fn discard(&self, handle: &RuntimeHandle) {
        if let Err(e) = self.driver.remove(handle).await {
            warn!(container_id = %handle, error = %e, "Failed to discard sandbox container");
        }
    }

    fn sandbox_spec(&self, id: &SessionId) -> SandboxSpec {
        let settings = &self.settings;
        SandboxSpec {
            name: format!("sandbox-{id}"),
            image: settings.sandbox_image.clone(),
            working_dir: settings.sandbox_workdir.clone(),
            env: vec![
                format!("SANDBOX_SESSION_ID={id}"),
                format!("SANDBOX_RELAY_URL={}", settings.agent_relay_url),
                format!("SANDBOX_DEV_MODE={}", settings.dev_mode),
                format!("SANDBOX_WORK_ROOT={}", settings.sandbox_workdir),
            ],
            labels: HashMap::from([
                (SESSION_LABEL.to_string(), id.to_string()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
            ]),
            preview_port: settings.preview_port,
            memory_limit: settings.sandbox_memory_limit,
            cpu_quota: settings.sandbox_cpu_quota,
            cpu_period: settings.sandbox_cpu_period,
        }
    }

    /// Stop and remove a sandbox, then forget it.
    ///
    /// A second call for the same id yields `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` for unknown (or already terminated)
    /// ids and `SandboxError::Runtime` if the runtime refuses the removal.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn terminate(&self, id: &SessionId) -> Result<(), SandboxError> {
        let mut previous = None;
        let sandbox = self
            .registry
            .update(id, |s| {
                previous = Some(s.status);
                if !matches!(s.status, SandboxStatus::Terminated | SandboxStatus::Deleted) {
                    s.status = SandboxStatus::Terminated;
                }
            })
            .await
            .ok_or_else(|| SandboxError::NotFound(id.clone()))?;

        match previous {
            Some(SandboxStatus::Deleted) => {
                // Vanished underneath us; nothing left to stop
                self.registry.remove(id).await;
                return Err(SandboxError::NotFound(id.clone()));
            }
            Some(SandboxStatus::Terminated) => {
                debug!("Termination already in progress");
                return Err(SandboxError::NotFound(id.clone()));
            }
            _ => {}
        }

        if let Some(handle) = &sandbox.runtime_handle {
            match self.driver.stop(handle).await {
                Ok(()) | Err(DriverError::NotFound(_)) => {}
                Err(e) => warn!(error = %e, "Failed to stop sandbox, removing anyway"),
            }

            match self.driver.remove(handle).await {
                Ok(()) | Err(DriverError::NotFound(_)) => {}
                Err(e) => {
                    self.registry.remove(id).await;
                    warn!(error = %e, "Failed to remove sandbox");
                    return Err(SandboxError::Runtime(e));
                }
            }
        }

        self.registry
            .update(id, |s| s.status = SandboxStatus::Deleted)
            .await;
        self.registry.remove(id).await;
        info!("Sandbox terminated");
        Ok(())
    }

    /// Re-inspect a sandbox and return its refreshed record.
    ///
    /// An inspection failure marks the sandbox `deleted` instead of failing.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` for unknown ids.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn get_status(&self, id: &SessionId) -> Result<Sandbox, SandboxError> {
        let sandbox = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SandboxError::NotFound(id.clone()))?;

        // Provisioning and termination own the status while they run
        let handle = match (&sandbox.runtime_handle, sandbox.status) {
            (Some(handle), SandboxStatus::Running | SandboxStatus::Stopped) => handle.clone(),
            _ => return Ok(sandbox),
        };

        let (status, preview_port) = match self.driver.inspect(&handle).await {
            Ok(runtime) if runtime.running => (SandboxStatus::Running, runtime.preview_host_port),
            Ok(runtime) => (SandboxStatus::Stopped, runtime.preview_host_port),
            Err(e) => {
                warn!(error = %e, "Sandbox inspection failed, marking deleted");
                (SandboxStatus::Deleted, None)
            }
        };

        self.registry
            .update(id, |s| {
                // A concurrent terminate wins
                if matches!(s.status, SandboxStatus::Running | SandboxStatus::Stopped) {
                    s.status = status;
                }
                if preview_port.is_some() {
                    s.preview_port = preview_port;
                }
            })
            .await
            .ok_or_else(|| SandboxError::NotFound(id.clone()))
    }

    /// Run `command` through `sh -c` and return stdout and stderr as one
    /// buffer.
    ///
    /// Calls for the same sandbox are not serialized against each other.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` for unknown or deleted sandboxes and
    /// `SandboxError::Exec` if the exec channel fails or times out.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn execute(&self, id: &SessionId, command: &str) -> Result<String, SandboxError> {
        let sandbox = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SandboxError::NotFound(id.clone()))?;

        if sandbox.status == SandboxStatus::Deleted {
            return Err(SandboxError::NotFound(id.clone()));
        }
        let handle = sandbox
            .runtime_handle
            .ok_or_else(|| SandboxError::Exec("sandbox is still being created".to_string()))?;

        debug!(command = %command, "Executing command");
        let request = ExecRequest::shell(command).in_dir(self.settings.sandbox_workdir.clone());
        let run = async {
            let stream = self.driver.exec(&handle, request).await?;
            collect_output(stream).await
        };

        let output = match self.exec_timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                SandboxError::Exec(format!("command timed out after {}ms", limit.as_millis()))
            })?,
            None => run.await,
        };

        output.map_err(|e| SandboxError::Exec(e.to_string()))
    }
}

fn terminated_during_provisioning() -> SandboxError {
    SandboxError::Provision("sandbox was terminated during provisioning".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::bootstrap::{AgentProgram, BootstrapState};
    use crate::sandbox::driver::MockRuntimeDriver;
    use crate::testing::{FakeDriver, FAKE_PREVIEW_HOST_PORT};
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn settings() -> GatewaySettings {
        GatewaySettings {
            bootstrap_diagnostics: false,
            ..GatewaySettings::default()
        }
    }

    fn manager(driver: Arc<dyn RuntimeDriver>) -> LifecycleManager {
        let settings = settings();
        let mut plan = BootstrapPlan::from_settings(&settings);
        plan.program = AgentProgram::Bytes(Bytes::from_static(b"#!agent"));
        LifecycleManager::new(driver, settings).with_bootstrap_plan(plan)
    }

    #[tokio::test]
    async fn test_create_returns_running_sandbox() -> Result<(), SandboxError> {
        let driver = Arc::new(FakeDriver::new());
        let manager = manager(driver.clone());

        let sandbox = manager.create().await?;
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.preview_port, Some(FAKE_PREVIEW_HOST_PORT));
        assert_eq!(sandbox.bootstrap, BootstrapState::Started);
        assert_eq!(sandbox.relay_endpoint, "ws://localhost:9001/relay");

        let specs = driver.created_specs();
        assert_eq!(specs.len(), 1);
        assert!(specs[0]
            .env
            .contains(&format!("SANDBOX_SESSION_ID={}", sandbox.id)));
        assert_eq!(specs[0].labels.get(SESSION_LABEL), Some(&sandbox.id.to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_entry() {
        let mut mock = MockRuntimeDriver::new();
        mock.expect_create()
            .returning(|_| Err(DriverError::Unavailable("engine down".to_string())));
        mock.expect_remove().never();
        let manager = manager(Arc::new(mock));

        let result = manager.create().await;
        assert!(matches!(result, Err(SandboxError::Provision(_))));
        assert!(manager.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_start_failure_discards_container() {
        let driver = Arc::new(FakeDriver::new());
        driver.fail_start(true);
        let manager = manager(driver.clone());

        assert!(matches!(manager.create().await, Err(SandboxError::Provision(_))));
        assert_eq!(driver.container_count(), 0);
        assert!(manager.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_does_not_fail_create() -> Result<(), SandboxError> {
        let driver = Arc::new(FakeDriver::new());
        driver.fail_exec_matching("nohup");
        let manager = manager(driver.clone());

        let sandbox = manager.create().await?;
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(matches!(sandbox.bootstrap, BootstrapState::Failed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_during_create_wins() -> Result<(), Box<dyn std::error::Error>> {
        const WAIT: Duration = Duration::from_secs(5);
        let driver = Arc::new(FakeDriver::new());
        let exec_gate = driver.hold_execs();
        let stop_gate = driver.hold_stops();
        let manager = Arc::new(manager(driver.clone()));

        let creating = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create().await }
        });

        // Bootstrap is parked once the container handle is on the record
        let id = tokio::time::timeout(WAIT, async {
            loop {
                let sandboxes = manager.list().await;
                if let Some(s) = sandboxes.into_iter().find(|s| s.runtime_handle.is_some()) {
                    return s.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        let terminating = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.terminate(&id).await }
        });
        tokio::time::timeout(WAIT, async {
            while manager.registry().get(&id).await.map(|s| s.status)
                != Some(SandboxStatus::Terminated)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        // Provisioning finishes while terminate is still stopping the container
        exec_gate.add_permits(1);
        let created = tokio::time::timeout(WAIT, creating).await??;
        assert!(matches!(created, Err(SandboxError::Provision(_))));
        assert!(manager
            .registry()
            .get(&id)
            .await
            .is_none_or(|s| s.status != SandboxStatus::Running));

        stop_gate.add_permits(1);
        tokio::time::timeout(WAIT, terminating).await???;
        assert!(manager.registry().is_empty().await);
        assert_eq!(driver.container_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_twice_yields_not_found() -> Result<(), SandboxError> {
        let driver = Arc::new(FakeDriver::new());
        let manager = manager(driver.clone());
        let sandbox = manager.create().await?;

        manager.terminate(&sandbox.id).await?;
        let second = manager.terminate(&sandbox.id).await;
        assert!(matches!(second, Err(SandboxError::NotFound(_))));
        assert_eq!(driver.container_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let manager = manager(Arc::new(FakeDriver::new()));
        let id = SessionId::from("never-created");

        assert!(manager.get_status(&id).await.is_err_and(|e| e.is_not_found()));
        assert!(manager.terminate(&id).await.is_err_and(|e| e.is_not_found()));
        assert!(manager.execute(&id, "ls").await.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_get_status_tracks_runtime() -> Result<(), SandboxError> {
        let driver = Arc::new(FakeDriver::new());
        let manager = manager(driver.clone());
        let sandbox = manager.create().await?;
        let handle = sandbox.runtime_handle.clone().ok_or_else(|| {
            SandboxError::Provision("no runtime handle recorded".to_string())
        })?;

        driver.halt(&handle);
        assert_eq!(manager.get_status(&sandbox.id).await?.status, SandboxStatus::Stopped);

        driver.vanish(&handle);
        assert_eq!(manager.get_status(&sandbox.id).await?.status, SandboxStatus::Deleted);

        // Deleted records short-circuit terminate and are dropped
        assert!(manager.terminate(&sandbox.id).await.is_err_and(|e| e.is_not_found()));
        assert!(manager.registry().is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_collects_output() -> Result<(), SandboxError> {
        let driver = Arc::new(FakeDriver::new());
        let manager = manager(driver.clone());
        let sandbox = manager.create().await?;

        let output = manager.execute(&sandbox.id, "echo hi").await?;
        assert_eq!(output, "hi\n");

        let last = driver.exec_log().pop();
        assert_eq!(last.and_then(|r| r.working_dir), Some("/app".to_string()));
        Ok(())
    }

    fn running_mock() -> MockRuntimeDriver {
        let mut mock = MockRuntimeDriver::new();
        mock.expect_create()
            .returning(|_| Ok(RuntimeHandle::new("c1")));
        mock.expect_start().returning(|_| Ok(()));
        mock.expect_inspect().returning(|_| {
            Ok(RuntimeStatus {
                running: true,
                preview_host_port: Some(32768),
            })
        });
        mock.expect_exec()
            .returning(|_, _| Ok(futures_util::stream::empty().boxed()));
        mock
    }

    #[tokio::test]
    async fn test_stop_failure_still_removes() -> Result<(), SandboxError> {
        let mut mock = running_mock();
        mock.expect_stop()
            .times(1)
            .returning(|_| Err(DriverError::Unavailable("timeout".to_string())));
        mock.expect_remove().times(1).returning(|_| Ok(()));
        let manager = manager(Arc::new(mock));

        let sandbox = manager.create().await?;
        manager.terminate(&sandbox.id).await?;
        assert!(manager.registry().is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_failure_is_runtime_error() -> Result<(), SandboxError> {
        let mut mock = running_mock();
        mock.expect_stop().returning(|_| Ok(()));
        mock.expect_remove()
            .returning(|_| Err(DriverError::Unavailable("device busy".to_string())));
        let manager = manager(Arc::new(mock));

        let sandbox = manager.create().await?;
        let result = manager.terminate(&sandbox.id).await;
        assert!(matches!(result, Err(SandboxError::Runtime(_))));
        assert!(manager.registry().get(&sandbox.id).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_times_out() -> Result<(), SandboxError> {
        let mut mock = MockRuntimeDriver::new();
        mock.expect_create()
            .returning(|_| Ok(RuntimeHandle::new("c1")));
        mock.expect_start().returning(|_| Ok(()));
        mock.expect_inspect().returning(|_| {
            Ok(RuntimeStatus {
                running: true,
                preview_host_port: None,
            })
        });
        mock.expect_exec().returning(|_, request| {
            if request.cmd.iter().any(|arg| arg == "sleep 60") {
                Ok(futures_util::stream::pending().boxed())
            } else {
                Ok(futures_util::stream::empty().boxed())
            }
        });
        let manager = manager(Arc::new(mock)).with_exec_timeout(Duration::from_millis(20));

        let sandbox = manager.create().await?;
        let result = manager.execute(&sandbox.id, "sleep 60").await;
        assert!(matches!(result, Err(SandboxError::Exec(_))));
        Ok(())
    }
}
