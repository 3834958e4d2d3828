//! Docker runtime driver using Bollard
//!
//! Translates `RuntimeDriver` calls into Docker Engine API requests.

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::driver::{
    DriverError, ExecChunk, ExecRequest, ExecStream, RuntimeDriver, RuntimeHandle, RuntimeStatus,
    SandboxSpec,
};

/// Docker-backed runtime driver
#[derive(Clone)]
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect to the local Docker daemon and verify it answers
    ///
    /// # Errors
    ///
    /// Returns an error if connection to Docker daemon fails or ping fails.
    pub async fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()?;

        docker
            .ping()
            .await
            .map_err(|e| DriverError::Unavailable(format!("Failed to ping Docker daemon: {e}")))?;

        debug!("Docker connection established");
        Ok(Self { docker })
    }

    /// Pull the image, tolerating failure when a local copy may exist
    async fn pull_image(&self, image: &str) {
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };

        info!(image = %image, "Pulling sandbox image");
        let result = self
            .docker
            .create_image(Some(options), None, None)
            .try_for_each(|_| async { Ok(()) })
            .await;

        match result {
            Ok(()) => debug!(image = %image, "Image pulled"),
            Err(e) => warn!(image = %image, error = %e, "Failed to pull image, trying local copy"),
        }
    }

    fn port_key(port: u16) -> String {
        format!("{port}/tcp")
    }
}

fn map_not_found(handle: &RuntimeHandle, err: bollard::errors::Error) -> DriverError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(handle.to_string()),
        other => DriverError::Docker(other),
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeHandle, DriverError> {
        self.pull_image(&spec.image).await;

        let port_key = Self::port_key(spec.preview_port);

        let host_config = HostConfig {
            memory: Some(spec.memory_limit),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            network_mode: Some("bridge".to_string()),
            // Lets the agent reach the gateway on Linux hosts too
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            // Host port "0" asks the engine for an ephemeral port
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some("0".to_string()),
                }]),
            )])),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some("sandbox".to_string()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            open_stdin: Some(true),
            tty: Some(true),
            // Keep container running
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        info!(container_id = %response.id, "Sandbox container created");

        Ok(RuntimeHandle::new(response.id))
    }

    #[instrument(skip(self), fields(container_id = %handle))]
    async fn start(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        self.docker
            .start_container(handle.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|e| map_not_found(handle, e))?;
        info!(container_id = %handle, "Sandbox container started");
        Ok(())
    }

    #[instrument(skip(self, request), fields(container_id = %handle))]
    async fn exec(
        &self,
        handle: &RuntimeHandle,
        request: ExecRequest,
    ) -> Result<ExecStream, DriverError> {
        let has_stdin = request.stdin.is_some();

        let exec_options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(has_stdin),
            cmd: Some(request.cmd),
            working_dir: request.working_dir,
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(handle.as_str(), exec_options)
            .await
            .map_err(|e| map_not_found(handle, e))?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, mut input } => {
                if let Some(stdin) = request.stdin {
                    input.write_all(&stdin).await?;
                    input.shutdown().await?;
                    debug!(exec_id = %exec.id, bytes = stdin.len(), "Exec stdin written");
                }

                let stream = output.filter_map(|msg| async move {
                    match msg {
                        Ok(bollard::container::LogOutput::StdOut { message })
                        | Ok(bollard::container::LogOutput::Console { message }) => {
                            Some(Ok(ExecChunk::Stdout(message)))
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            Some(Ok(ExecChunk::Stderr(message)))
                        }
                        Ok(bollard::container::LogOutput::StdIn { .. }) => None,
                        Err(e) => Some(Err(DriverError::Docker(e))),
                    }
                });
                Ok(stream.boxed())
            }
            StartExecResults::Detached => Ok(futures_util::stream::empty().boxed()),
        }
    }

    #[instrument(skip(self), fields(container_id = %handle))]
    async fn inspect(&self, handle: &RuntimeHandle) -> Result<RuntimeStatus, DriverError> {
        let info = self
            .docker
            .inspect_container(handle.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_not_found(handle, e))?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        // First published binding of the first exposed port
        let preview_host_port = info
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|ports| {
                ports
                    .into_values()
                    .flatten()
                    .flatten()
                    .find_map(|binding| binding.host_port)
            })
            .and_then(|port| port.parse::<u16>().ok());

        Ok(RuntimeStatus {
            running,
            preview_host_port,
        })
    }

    #[instrument(skip(self), fields(container_id = %handle))]
    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        self.docker
            .stop_container(handle.as_str(), None::<StopContainerOptions>)
            .await
            .map_err(|e| map_not_found(handle, e))?;
        info!(container_id = %handle, "Sandbox container stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(container_id = %handle))]
    async fn remove(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(handle.as_str(), Some(options))
            .await
            .map_err(|e| map_not_found(handle, e))?;
        info!(container_id = %handle, "Sandbox container removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    // Integration test - requires Docker
    #[tokio::test]
    #[ignore = "Requires Docker daemon"]
    async fn test_docker_driver_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
        let driver = DockerDriver::connect().await?;
        let spec = SandboxSpec {
            name: format!("sandbox-gateway-test-{}", uuid::Uuid::new_v4()),
            image: crate::config::SANDBOX_IMAGE.to_string(),
            working_dir: "/".to_string(),
            env: vec!["SANDBOX_SESSION_ID=test".to_string()],
            labels: HashMap::new(),
            preview_port: 3000,
            memory_limit: crate::config::SANDBOX_MEMORY_LIMIT,
            cpu_quota: crate::config::SANDBOX_CPU_QUOTA,
            cpu_period: crate::config::SANDBOX_CPU_PERIOD,
        };

        let handle = driver.create(&spec).await?;
        driver.start(&handle).await?;

        let status = driver.inspect(&handle).await?;
        assert!(status.running);
        assert!(status.preview_host_port.is_some());

        let chunks: Vec<ExecChunk> = driver
            .exec(
                &handle,
                ExecRequest::shell("cat").with_stdin(bytes::Bytes::from_static(b"hello")),
            )
            .await?
            .try_collect()
            .await?;
        let output: Vec<u8> = chunks.iter().flat_map(|c| c.bytes().to_vec()).collect();
        assert_eq!(String::from_utf8_lossy(&output), "hello");

        driver.stop(&handle).await?;
        driver.remove(&handle).await?;
        assert!(matches!(
            driver.inspect(&handle).await,
            Err(DriverError::NotFound(_))
        ));
        Ok(())
    }
}
