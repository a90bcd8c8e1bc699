//! Sandbox provider seam
//!
//! `SandboxProvider` is the capability a compute backend exposes to the hub:
//! run commands, capture an image, forward agent tool calls. A
//! `SandboxHandle` binds one provider to one sandbox id and is owned by
//! exactly one hub.

mod docker;

pub use docker::DockerSandboxProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Errors raised at the sandbox boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Provider rejected attach or the sandbox is gone
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    /// Command did not finish within its timeout
    #[error("command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },
    /// Interrupted by a stop request
    #[error("sandbox call cancelled")]
    Cancelled,
    /// Provider failed to run the command
    #[error("command execution failed: {0}")]
    Exec(String),
    /// Provider failed to capture an image
    #[error("snapshot capture failed: {0}")]
    Capture(String),
}

/// Result of executing a command in the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Standard output of the command
    pub stdout: String,
    /// Standard error of the command
    pub stderr: String,
    /// Exit code of the command
    pub exit_code: i64,
}

impl ExecResult {
    /// Check if the command succeeded (exit code 0)
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr)
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Hard timeout for the command
    pub timeout_ms: u64,
    /// Stop signal threaded from the owning hub
    pub cancellation: Option<CancellationToken>,
}

impl ExecOptions {
    /// Options with a timeout and no cancellation
    #[must_use]
    pub const fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            cancellation: None,
        }
    }
}

/// Durable image produced by a capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    /// Provider-specific image identifier
    pub image_id: String,
}

/// Capability exposed by a sandbox compute backend.
///
/// Implementations are held as `Arc<dyn SandboxProvider>` and always invoked
/// through that reference, so per-provider state (clients, connections) stays
/// bound to every call.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Confirm the sandbox exists and is reachable
    async fn attach(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Run `argv` inside the sandbox
    async fn execute(
        &self,
        sandbox_id: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError>;

    /// Capture a durable image of the sandbox state
    async fn capture_snapshot(&self, sandbox_id: &str) -> Result<SnapshotImage, SandboxError>;

    /// Hand an agent tool call to the process inside the sandbox
    async fn forward_tool_call(
        &self,
        sandbox_id: &str,
        name: &str,
        args: &serde_json::Value,
        options: ExecOptions,
    ) -> Result<serde_json::Value, SandboxError>;

    /// Suspend the sandbox
    async fn pause(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Resume a suspended sandbox
    async fn resume(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Tear the sandbox down
    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

/// A provider bound to one sandbox, exclusively owned by one hub
pub struct SandboxHandle {
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: String,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("provider", &self.provider.name())
            .field("sandbox_id", &self.sandbox_id)
            .finish_non_exhaustive()
    }
}

impl SandboxHandle {
    /// Attach to `sandbox_id` through `provider`
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Unavailable` if the provider rejects the attach
    /// or the stop signal fires first.
    #[instrument(skip(provider, cancellation), fields(backend = provider.name()))]
    pub async fn attach(
        provider: Arc<dyn SandboxProvider>,
        sandbox_id: &str,
        cancellation: CancellationToken,
    ) -> Result<Self, SandboxError> {
        let attached = tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(SandboxError::Cancelled),
            res = provider.attach(sandbox_id) => res,
        };
        attached.map_err(|e| match e {
            SandboxError::Unavailable(reason) => SandboxError::Unavailable(reason),
            other => SandboxError::Unavailable(other.to_string()),
        })?;
        debug!(sandbox_id, "Sandbox attached");

        Ok(Self {
            provider,
            sandbox_id: sandbox_id.to_string(),
            cancellation,
        })
    }

    /// Sandbox id this handle is bound to
    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Provider behind this handle
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Forward an agent tool call to the sandbox and relay its response
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `Cancelled`, or the provider's own error.
    pub async fn forward_tool_call(
        &self,
        name: &str,
        args: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SandboxError> {
        let options = ExecOptions {
            timeout_ms: duration_ms(timeout),
            cancellation: Some(self.cancellation.clone()),
        };
        self.guarded(
            timeout,
            self.provider
                .forward_tool_call(&self.sandbox_id, name, args, options),
        )
        .await
    }

    /// Capture a snapshot image
    ///
    /// # Errors
    ///
    /// Returns `Capture`, `Timeout`, or `Cancelled`.
    pub async fn capture(&self, timeout: Duration) -> Result<SnapshotImage, SandboxError> {
        self.guarded(timeout, self.provider.capture_snapshot(&self.sandbox_id))
            .await
    }

    /// Suspend the sandbox
    ///
    /// # Errors
    ///
    /// Returns the provider's error.
    pub async fn pause(&self) -> Result<(), SandboxError> {
        self.provider.pause(&self.sandbox_id).await
    }

    /// Resume the sandbox
    ///
    /// # Errors
    ///
    /// Returns the provider's error.
    pub async fn resume(&self) -> Result<(), SandboxError> {
        self.provider.resume(&self.sandbox_id).await
    }

    /// Tear down the sandbox, consuming the handle.
    ///
    /// Not subject to the stop signal: teardown is what a stop asks for.
    ///
    /// # Errors
    ///
    /// Returns the provider's termination error.
    pub async fn release(self) -> Result<(), SandboxError> {
        let result = self.provider.terminate(&self.sandbox_id).await;
        if let Err(e) = &result {
            warn!(sandbox_id = %self.sandbox_id, error = %e, "Sandbox termination failed");
        }
        result
    }

    async fn guarded<T>(
        &self,
        timeout: Duration,
        call: impl std::future::Future<Output = Result<T, SandboxError>>,
    ) -> Result<T, SandboxError> {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(SandboxError::Cancelled),
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(inner) => inner,
                Err(_) => Err(SandboxError::Timeout { timeout_ms: duration_ms(timeout) }),
            },
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct SlowProvider {
        attach_calls: AtomicUsize,
        reject_attach: bool,
    }

    #[async_trait]
    impl SandboxProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn attach(&self, sandbox_id: &str) -> Result<(), SandboxError> {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_attach {
                return Err(SandboxError::Exec(format!("no such sandbox {sandbox_id}")));
            }
            Ok(())
        }

        async fn execute(
            &self,
            _sandbox_id: &str,
            _argv: &[String],
            _options: ExecOptions,
        ) -> Result<ExecResult, SandboxError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ExecResult::default())
        }

        async fn capture_snapshot(&self, _sandbox_id: &str) -> Result<SnapshotImage, SandboxError> {
            Ok(SnapshotImage {
                image_id: "img".to_string(),
            })
        }

        async fn forward_tool_call(
            &self,
            _sandbox_id: &str,
            _name: &str,
            _args: &serde_json::Value,
            _options: ExecOptions,
        ) -> Result<serde_json::Value, SandboxError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }

        async fn terminate(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    #[test]
    fn combined_output_joins_streams() {
        let result = ExecResult {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            exit_code: 1,
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn attach_rejection_is_unavailable() {
        let provider = Arc::new(SlowProvider {
            reject_attach: true,
            ..SlowProvider::default()
        });
        let result =
            SandboxHandle::attach(provider.clone(), "sandbox-1", CancellationToken::new()).await;
        assert!(matches!(result, Err(SandboxError::Unavailable(_))));
        assert_eq!(provider.attach_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_times_out_instead_of_hanging() -> Result<(), SandboxError> {
        let handle =
            SandboxHandle::attach(Arc::new(SlowProvider::default()), "sandbox-1", CancellationToken::new())
                .await?;
        let result = handle
            .forward_tool_call("run", &serde_json::json!({}), Duration::from_millis(15_000))
            .await;
        assert_eq!(result, Err(SandboxError::Timeout { timeout_ms: 15_000 }));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_call() -> Result<(), SandboxError> {
        let token = CancellationToken::new();
        let handle =
            SandboxHandle::attach(Arc::new(SlowProvider::default()), "sandbox-1", token.clone())
                .await?;

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = handle
            .forward_tool_call("run", &serde_json::json!({}), Duration::from_secs(3600))
            .await;
        let _ = canceller.await;

        assert_eq!(result, Err(SandboxError::Cancelled));
        Ok(())
    }
}
