//! Scrub → capture → re-apply orchestration
//!
//! `prepare_for_snapshot` scrubs env files and hands back a `CleanupGuard`.
//! Callers capture, then call `CleanupGuard::apply` on every exit path. A
//! guard dropped without being applied schedules the re-apply itself.

use super::{CatalogError, ConfigurationCatalog, SnapshotLogPayload, SnapshotLogger};
use crate::config::{ENV_SCRUB_TIMEOUT_MS, SANDBOX_CLI};
use crate::sandbox::{ExecOptions, SandboxError, SandboxProvider};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// What to do when the pre-capture scrub fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Abort the snapshot
    #[default]
    Throw,
    /// Log and continue as if no scrub was attempted
    Log,
}

/// Why an env scrub/apply command did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvCommandFailure {
    /// Command exited non-zero
    ExitCode(i64),
    /// Command exceeded the scrub timeout
    TimedOut,
    /// Stop request interrupted the command
    Cancelled,
    /// Provider could not run the command at all
    Unreachable,
}

impl fmt::Display for EnvCommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exit code {code}"),
            Self::TimedOut => write!(f, "timed out after {ENV_SCRUB_TIMEOUT_MS}ms"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Unreachable => f.write_str("sandbox unreachable"),
        }
    }
}

/// Errors raised while preparing a snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Scrub failed in `FailureMode::Throw`
    #[error("{context}: env scrub failed before snapshot: env scrub failed: {failure}")]
    ScrubFailed {
        /// Caller-supplied log context
        context: String,
        /// Underlying failure
        failure: EnvCommandFailure,
    },
    /// Configuration env files could not be fetched in `FailureMode::Throw`
    #[error("{context}: failed to load configuration env files: {source}")]
    Catalog {
        /// Caller-supplied log context
        context: String,
        /// Catalog failure
        source: CatalogError,
    },
    /// Env spec could not be serialized
    #[error("{context}: failed to encode env spec: {message}")]
    Encode {
        /// Caller-supplied log context
        context: String,
        /// Encoder message
        message: String,
    },
}

/// Inputs to `prepare_for_snapshot`
pub struct SnapshotPrepareOptions {
    /// Provider the scrub/apply commands run through
    pub provider: Arc<dyn SandboxProvider>,
    /// Source of the env spec
    pub catalog: Arc<dyn ConfigurationCatalog>,
    /// Target sandbox
    pub sandbox_id: String,
    /// Configuration whose env files to protect; `None` means nothing to scrub
    pub configuration_id: Option<String>,
    /// Structured logger
    pub logger: Arc<dyn SnapshotLogger>,
    /// Prefix for every log and error message
    pub log_context: String,
    /// Behaviour on scrub failure
    pub failure_mode: FailureMode,
    /// Whether the guard restores the env files
    pub reapply_after_capture: bool,
    /// Stop signal for the scrub command
    pub cancellation: Option<CancellationToken>,
}

/// argv for the in-sandbox env subcommand (`scrub` or `apply`)
#[must_use]
pub fn env_command_argv(subcommand: &str, serialized_spec: &str) -> Vec<String> {
    vec![
        SANDBOX_CLI.to_string(),
        "env".to_string(),
        subcommand.to_string(),
        "--spec".to_string(),
        serialized_spec.to_string(),
    ]
}

async fn run_env_command(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    subcommand: &str,
    serialized_spec: &str,
    cancellation: Option<CancellationToken>,
) -> Result<(), EnvCommandFailure> {
    let argv = env_command_argv(subcommand, serialized_spec);
    let options = ExecOptions {
        timeout_ms: ENV_SCRUB_TIMEOUT_MS,
        cancellation: cancellation.clone(),
    };

    let call = tokio::time::timeout(
        Duration::from_millis(ENV_SCRUB_TIMEOUT_MS),
        provider.execute(sandbox_id, &argv, options),
    );
    let outcome = match cancellation {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => return Err(EnvCommandFailure::Cancelled),
            res = call => res,
        },
        None => call.await,
    };

    // Only the exit code crosses this boundary; stdout/stderr are dropped here
    match outcome {
        Err(_) | Ok(Err(SandboxError::Timeout { .. })) => Err(EnvCommandFailure::TimedOut),
        Ok(Err(SandboxError::Cancelled)) => Err(EnvCommandFailure::Cancelled),
        Ok(Err(_)) => Err(EnvCommandFailure::Unreachable),
        Ok(Ok(result)) if result.success() => Ok(()),
        Ok(Ok(result)) => Err(EnvCommandFailure::ExitCode(result.exit_code)),
    }
}

/// Scrub the sandbox's secret env files ahead of a capture.
///
/// With no configuration id the provider is never contacted and the guard is
/// a no-op. Otherwise the env spec is fetched once, serialized once, and that
/// exact string is used for both the scrub and the guard's re-apply.
///
/// # Errors
///
/// In `FailureMode::Throw`, returns `SnapshotError::ScrubFailed` when the scrub
/// exits non-zero or times out, and `SnapshotError::Catalog` when the spec
/// cannot be fetched. `FailureMode::Log` never fails.
pub async fn prepare_for_snapshot(
    options: SnapshotPrepareOptions,
) -> Result<CleanupGuard, SnapshotError> {
    let SnapshotPrepareOptions {
        provider,
        catalog,
        sandbox_id,
        configuration_id,
        logger,
        log_context,
        failure_mode,
        reapply_after_capture,
        cancellation,
    } = options;

    let Some(configuration_id) = configuration_id else {
        return Ok(CleanupGuard::noop());
    };

    let spec = match catalog.get_configuration_env_files(&configuration_id).await {
        Ok(spec) => spec,
        Err(source) => {
            return match failure_mode {
                FailureMode::Throw => Err(SnapshotError::Catalog {
                    context: log_context,
                    source,
                }),
                FailureMode::Log => {
                    logger.error(
                        &SnapshotLogPayload::from_message(source.to_string()),
                        &format!("{log_context}: failed to load configuration env files"),
                    );
                    Ok(CleanupGuard::noop())
                }
            };
        }
    };

    let serialized_spec = serde_json::to_string(&spec).map_err(|e| SnapshotError::Encode {
        context: log_context.clone(),
        message: e.to_string(),
    })?;

    logger.info(&format!(
        "{log_context}: scrubbing {} env file(s) before snapshot",
        spec.files.len()
    ));

    if let Err(failure) = run_env_command(
        provider.as_ref(),
        &sandbox_id,
        "scrub",
        &serialized_spec,
        cancellation,
    )
    .await
    {
        return match failure_mode {
            FailureMode::Throw => Err(SnapshotError::ScrubFailed {
                context: log_context,
                failure,
            }),
            FailureMode::Log => {
                logger.error(
                    &SnapshotLogPayload::from_message(format!("env scrub failed: {failure}")),
                    &format!("{log_context}: env scrub failed before snapshot"),
                );
                Ok(CleanupGuard::noop())
            }
        };
    }

    if !reapply_after_capture {
        return Ok(CleanupGuard::scrubbed_only());
    }

    Ok(CleanupGuard::with_reapply(PendingReapply {
        provider,
        sandbox_id,
        serialized_spec,
        logger,
        log_context,
    }))
}

struct PendingReapply {
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: String,
    serialized_spec: String,
    logger: Arc<dyn SnapshotLogger>,
    log_context: String,
}

impl PendingReapply {
    /// Never raises: cleanup usually runs after the caller already has its answer
    async fn run(&self) -> bool {
        match run_env_command(
            self.provider.as_ref(),
            &self.sandbox_id,
            "apply",
            &self.serialized_spec,
            None,
        )
        .await
        {
            Ok(()) => {
                self.logger
                    .info(&format!("{}: env files re-applied after snapshot", self.log_context));
                true
            }
            Err(failure) => {
                self.logger.error(
                    &SnapshotLogPayload::from_message(format!("env re-apply failed: {failure}")),
                    &format!("{}: env re-apply after snapshot failed", self.log_context),
                );
                false
            }
        }
    }
}

/// Disposable returned by `prepare_for_snapshot`.
///
/// `apply` performs the re-apply at most once no matter how often it is
/// called. If the guard is dropped unapplied while a re-apply is pending, the
/// re-apply is spawned on the current tokio runtime.
pub struct CleanupGuard {
    pending: Option<Arc<PendingReapply>>,
    scrubbed: bool,
    applied: AtomicBool,
}

impl fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("scrubbed", &self.scrubbed)
            .field("will_reapply", &self.will_reapply())
            .field("applied", &self.applied.load(Ordering::Acquire))
            .finish()
    }
}

impl CleanupGuard {
    /// Guard with nothing to restore
    #[must_use]
    pub const fn noop() -> Self {
        Self {
            pending: None,
            scrubbed: false,
            applied: AtomicBool::new(false),
        }
    }

    const fn scrubbed_only() -> Self {
        Self {
            pending: None,
            scrubbed: true,
            applied: AtomicBool::new(false),
        }
    }

    fn with_reapply(pending: PendingReapply) -> Self {
        Self {
            pending: Some(Arc::new(pending)),
            scrubbed: true,
            applied: AtomicBool::new(false),
        }
    }

    /// Whether env files were scrubbed by the preparation step
    #[must_use]
    pub const fn scrubbed(&self) -> bool {
        self.scrubbed
    }

    /// Whether `apply` has a re-apply left to perform
    #[must_use]
    pub fn will_reapply(&self) -> bool {
        self.pending.is_some() && !self.applied.load(Ordering::Acquire)
    }

    /// Run the re-apply if one is pending and not yet run.
    ///
    /// Returns `true` when nothing was scrubbed or this call restored the
    /// env files; `false` when they stay scrubbed or an earlier call ran.
    pub async fn apply(&self) -> bool {
        let Some(pending) = &self.pending else {
            return !self.scrubbed;
        };
        if self.applied.swap(true, Ordering::AcqRel) {
            return false;
        }
        pending.run().await
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if *self.applied.get_mut() {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            warn!(
                sandbox_id = %pending.sandbox_id,
                "Cleanup guard dropped before apply, scheduling env re-apply"
            );
            runtime.spawn(async move {
                pending.run().await;
            });
        } else {
            error!(
                sandbox_id = %pending.sandbox_id,
                "Cleanup guard dropped outside a runtime, env files left scrubbed"
            );
        }
    }
}
