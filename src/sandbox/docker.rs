//! Docker sandbox provider using Bollard
//!
//! Each sandbox is a container; the sandbox id is the container id or name.

use super::{ExecOptions, ExecResult, SandboxError, SandboxProvider, SnapshotImage};
use crate::config::{SANDBOX_CLI, SNAPSHOT_REPOSITORY};
use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerConfig;
use bollard::query_parameters::{CommitContainerOptions, RemoveContainerOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Sandbox provider backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerSandboxProvider {
    docker: Docker,
    image_name: String,
}

impl DockerSandboxProvider {
    /// Connect to the Docker daemon
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Unavailable` if connection or ping fails.
    pub async fn connect(image_name: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(format!("failed to connect to Docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to ping Docker: {e}")))?;

        let image_name = image_name.into();
        debug!(image = %image_name, "Docker connection established");

        Ok(Self { docker, image_name })
    }

    /// Kill all processes in the container (SIGKILL).
    ///
    /// Best effort; used when a stop request interrupts a running exec.
    async fn kill_processes(&self, sandbox_id: &str) {
        let exec_options = CreateExecOptions {
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            cmd: Some(vec!["sh", "-c", "killall5 -9 2>/dev/null || true"]),
            ..Default::default()
        };

        if let Ok(exec) = self.docker.create_exec(sandbox_id, exec_options).await {
            let _ = tokio::time::timeout(
                Duration::from_secs(2),
                self.docker.start_exec(&exec.id, None),
            )
            .await;
            info!(sandbox_id, "Process kill signal sent");
        } else {
            warn!(sandbox_id, "Failed to create kill exec");
        }
    }

    /// Run the exec and collect output
    async fn run_exec(&self, exec_id: &str) -> Result<ExecResult, bollard::errors::Error> {
        let output = self.docker.start_exec(exec_id, None).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(msg) = output.next().await {
                match msg? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(exec_id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self))]
    async fn attach(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let inspect = self
            .docker
            .inspect_container(
                sandbox_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(|e| SandboxError::Unavailable(format!("container lookup failed: {e}")))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(SandboxError::Unavailable(format!(
                "container {sandbox_id} is not running"
            )));
        }

        let image = inspect.config.as_ref().and_then(|c| c.image.as_deref());
        if image != Some(self.image_name.as_str()) {
            warn!(
                sandbox_id,
                expected = %self.image_name,
                actual = image.unwrap_or("<unknown>"),
                "Sandbox runs an unexpected image"
            );
        }
        Ok(())
    }

    #[instrument(skip(self, argv, options), fields(argc = argv.len(), timeout_ms = options.timeout_ms))]
    async fn execute(
        &self,
        sandbox_id: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        let exec_options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.iter().map(String::as_str).collect()),
            working_dir: Some("/workspace"),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(sandbox_id, exec_options)
            .await
            .map_err(|e| SandboxError::Exec(format!("failed to create exec: {e}")))?;

        let timeout = Duration::from_millis(options.timeout_ms);
        let cancellation = options.cancellation.unwrap_or_default();

        let result = tokio::select! {
            res = tokio::time::timeout(timeout, self.run_exec(&exec.id)) => {
                res.map_err(|_| SandboxError::Timeout { timeout_ms: options.timeout_ms })?
                    .map_err(|e| SandboxError::Exec(e.to_string()))?
            },
            () = cancellation.cancelled() => {
                warn!(exec_id = %exec.id, "Exec cancelled by stop request, killing processes");
                self.kill_processes(sandbox_id).await;
                return Err(SandboxError::Cancelled);
            }
        };

        debug!(
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Command completed"
        );

        Ok(result)
    }

    #[instrument(skip(self))]
    async fn capture_snapshot(&self, sandbox_id: &str) -> Result<SnapshotImage, SandboxError> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let options = CommitContainerOptions {
            container: Some(sandbox_id.to_string()),
            repo: Some(SNAPSHOT_REPOSITORY.to_string()),
            tag: Some(tag),
            pause: true,
            ..Default::default()
        };

        let response = self
            .docker
            .commit_container(options, ContainerConfig::default())
            .await
            .map_err(|e| SandboxError::Capture(e.to_string()))?;

        info!(sandbox_id, image_id = %response.id, "Sandbox snapshot committed");
        Ok(SnapshotImage {
            image_id: response.id,
        })
    }

    async fn forward_tool_call(
        &self,
        sandbox_id: &str,
        name: &str,
        args: &serde_json::Value,
        options: ExecOptions,
    ) -> Result<serde_json::Value, SandboxError> {
        let argv = vec![
            SANDBOX_CLI.to_string(),
            "tool".to_string(),
            "run".to_string(),
            name.to_string(),
            "--args".to_string(),
            args.to_string(),
        ];
        let result = self.execute(sandbox_id, &argv, options).await?;

        // The in-sandbox runner prints JSON; anything else is relayed as text
        Ok(serde_json::from_str(result.stdout.trim()).unwrap_or_else(|_| {
            serde_json::json!({
                "exit_code": result.exit_code,
                "output": result.combined_output(),
            })
        }))
    }

    #[instrument(skip(self))]
    async fn pause(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.docker
            .pause_container(sandbox_id)
            .await
            .map_err(|e| SandboxError::Exec(format!("failed to pause container: {e}")))
    }

    #[instrument(skip(self))]
    async fn resume(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.docker
            .unpause_container(sandbox_id)
            .await
            .map_err(|e| SandboxError::Exec(format!("failed to unpause container: {e}")))
    }

    #[instrument(skip(self))]
    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        info!(sandbox_id, "Destroying sandbox container");

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(sandbox_id, Some(options))
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to remove container: {e}")))?;

        info!(sandbox_id, "Sandbox container destroyed");
        Ok(())
    }
}
