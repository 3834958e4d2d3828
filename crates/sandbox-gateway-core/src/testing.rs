//! Testing helpers.
//!
//! Provides an in-memory `RuntimeDriver` so lifecycle and relay behaviour can
//! be exercised without a Docker daemon.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::sandbox::driver::{
    DriverError, ExecChunk, ExecRequest, ExecStream, RuntimeDriver, RuntimeHandle, RuntimeStatus,
    SandboxSpec,
};

/// Host port the fake engine publishes the preview port on
pub const FAKE_PREVIEW_HOST_PORT: u16 = 49_153;

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<RuntimeHandle, bool>,
    specs: Vec<SandboxSpec>,
    execs: Vec<ExecRequest>,
    removed: HashSet<RuntimeHandle>,
    fail_create: bool,
    fail_start: bool,
    fail_remove: bool,
    fail_exec_patterns: Vec<String>,
    exec_gate: Option<Arc<Semaphore>>,
    stop_gate: Option<Arc<Semaphore>>,
}

/// Wait until the gate holds a permit. Permits are returned, so one permit
/// opens the gate for good.
async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        let _ = gate.acquire().await;
    }
}

/// In-memory container engine.
///
/// Containers are booleans (running or not). `sh -c "echo ..."` produces the
/// echoed text followed by a newline; every other command produces no output.
///
/// # Example
///
/// ```rust,ignore
/// use sandbox_gateway_core::testing::FakeDriver;
///
/// let driver = std::sync::Arc::new(FakeDriver::new());
/// driver.fail_create(true);
/// // Hand the driver to a LifecycleManager...
/// ```
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    /// Create an engine with no containers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        // A poisoned lock only means another test thread panicked
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make every `create` call fail
    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    /// Make every `start` call fail
    pub fn fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    /// Make every `remove` call fail
    pub fn fail_remove(&self, fail: bool) {
        self.state().fail_remove = fail;
    }

    /// Make execs whose command line contains `pattern` fail
    pub fn fail_exec_matching(&self, pattern: &str) {
        self.state().fail_exec_patterns.push(pattern.to_string());
    }

    /// Park every `exec` until a permit is added to the returned gate
    #[must_use]
    pub fn hold_execs(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state().exec_gate = Some(gate.clone());
        gate
    }

    /// Park every `stop` until a permit is added to the returned gate
    #[must_use]
    pub fn hold_stops(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state().stop_gate = Some(gate.clone());
        gate
    }

    /// Remove a container behind the gateway's back
    pub fn vanish(&self, handle: &RuntimeHandle) {
        self.state().containers.remove(handle);
    }

    /// Stop a container behind the gateway's back
    pub fn halt(&self, handle: &RuntimeHandle) {
        if let Some(running) = self.state().containers.get_mut(handle) {
            *running = false;
        }
    }

    /// Every exec request seen so far
    #[must_use]
    pub fn exec_log(&self) -> Vec<ExecRequest> {
        self.state().execs.clone()
    }

    /// Every spec passed to `create`
    #[must_use]
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.state().specs.clone()
    }

    /// Number of containers that exist
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    /// Whether `remove` succeeded for this handle
    #[must_use]
    pub fn was_removed(&self, handle: &RuntimeHandle) -> bool {
        self.state().removed.contains(handle)
    }

    fn simulate(request: &ExecRequest) -> String {
        match request.cmd.as_slice() {
            [sh, flag, script] if sh == "sh" && flag == "-c" => script
                .strip_prefix("echo ")
                .map(|rest| format!("{rest}\n"))
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl RuntimeDriver for FakeDriver {
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeHandle, DriverError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(DriverError::Unavailable("fake engine refused create".into()));
        }
        state.next_id += 1;
        let handle = RuntimeHandle::new(format!("fake-{}", state.next_id));
        state.containers.insert(handle.clone(), false);
        state.specs.push(spec.clone());
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        if state.fail_start {
            return Err(DriverError::Unavailable("fake engine refused start".into()));
        }
        let running = state
            .containers
            .get_mut(handle)
            .ok_or_else(|| DriverError::NotFound(handle.to_string()))?;
        *running = true;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        request: ExecRequest,
    ) -> Result<ExecStream, DriverError> {
        let gate = self.state().exec_gate.clone();
        pass(gate).await;
        let mut state = self.state();
        state.execs.push(request.clone());
        if !state.containers.contains_key(handle) {
            return Err(DriverError::NotFound(handle.to_string()));
        }
        let line = request.cmd.join(" ");
        if state.fail_exec_patterns.iter().any(|p| line.contains(p)) {
            return Err(DriverError::Unavailable(format!("fake exec failed: {line}")));
        }

        let output = Self::simulate(&request);
        let chunks = if output.is_empty() {
            Vec::new()
        } else {
            vec![Ok(ExecChunk::Stdout(Bytes::from(output)))]
        };
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<RuntimeStatus, DriverError> {
        let state = self.state();
        let running = state
            .containers
            .get(handle)
            .copied()
            .ok_or_else(|| DriverError::NotFound(handle.to_string()))?;
        Ok(RuntimeStatus {
            running,
            preview_host_port: Some(FAKE_PREVIEW_HOST_PORT),
        })
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        let gate = self.state().stop_gate.clone();
        pass(gate).await;
        let mut state = self.state();
        let running = state
            .containers
            .get_mut(handle)
            .ok_or_else(|| DriverError::NotFound(handle.to_string()))?;
        *running = false;
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        if state.fail_remove {
            return Err(DriverError::Unavailable("fake engine refused remove".into()));
        }
        state
            .containers
            .remove(handle)
            .ok_or_else(|| DriverError::NotFound(handle.to_string()))?;
        state.removed.insert(handle.clone());
        Ok(())
    }
}

impl SandboxSpec {
    /// Minimal spec for tests
    #[must_use]
    pub fn for_tests(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: crate::config::SANDBOX_IMAGE.to_string(),
            working_dir: crate::config::SANDBOX_WORKDIR.to_string(),
            env: Vec::new(),
            labels: HashMap::new(),
            preview_port: crate::config::SANDBOX_PREVIEW_PORT,
            memory_limit: crate::config::SANDBOX_MEMORY_LIMIT,
            cpu_quota: crate::config::SANDBOX_CPU_QUOTA,
            cpu_period: crate::config::SANDBOX_CPU_PERIOD,
        }
    }
}
