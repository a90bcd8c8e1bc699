//! Session hub
//!
//! One `SessionHub` per session owns the sandbox handle and is the only
//! writer of the session's status, both in memory and in the store. The hub
//! itself is driven sequentially by the actor loop in [`actor`], which is
//! what keeps at most one tool call in flight per session.

mod actor;
mod registry;

pub use actor::{HubCommand, HubEvent, HubHandle};
pub use registry::HubRegistry;

use crate::config::{SNAPSHOT_CAPTURE_TIMEOUT_SECS, TOOL_CALL_TIMEOUT_SECS};
use crate::sandbox::{SandboxError, SandboxHandle, SandboxProvider, SnapshotImage};
use crate::session::{Session, SessionStatus, SessionStore, StoreError};
use crate::snapshot::{
    prepare_for_snapshot, ConfigurationCatalog, FailureMode, SnapshotError, SnapshotLogger,
    SnapshotPrepareOptions, TracingSnapshotLogger,
};
use crate::tools::{ToolOutcome, ToolRegistry};
use crate::utils::truncate_str;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors surfaced by hub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// Provider rejected the attach
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    /// Provider capture primitive failed; env cleanup already ran
    #[error("snapshot capture failed: {0}")]
    CaptureFailed(String),
    /// Snapshot preparation failed before capture
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Status change not allowed by the state machine
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: SessionStatus,
        /// Requested status
        to: SessionStatus,
    },
    /// Operation not allowed in the current status
    #[error("cannot {operation} while session is {status}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// Current status
        status: SessionStatus,
    },
    /// No sandbox is attached
    #[error("no sandbox attached")]
    NotAttached,
    /// Sandbox call failed
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Hub has shut down
    #[error("session hub is closed")]
    Closed,
    /// Another live hub owns the sandbox
    #[error("sandbox {sandbox_id} is already owned by session {owner}")]
    SandboxInUse {
        /// Contested sandbox
        sandbox_id: String,
        /// Session currently owning it
        owner: String,
    },
    /// A hub is already running for the session
    #[error("session {0} already has a live hub")]
    SessionActive(String),
}

/// Where a tool call was answered
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "route", content = "output", rename_all = "snake_case")]
pub enum ToolResponse {
    /// Executed by the hub; the sandbox never saw the call
    Intercepted(ToolOutcome),
    /// Sandbox response, relayed verbatim
    Forwarded(serde_json::Value),
}

/// Collaborators shared by every hub in the process
#[derive(Clone)]
pub struct HubDeps {
    /// Persistence seam for session rows
    pub store: Arc<dyn SessionStore>,
    /// Compute backend
    pub provider: Arc<dyn SandboxProvider>,
    /// Configuration env catalog
    pub catalog: Arc<dyn ConfigurationCatalog>,
    /// Intercepted tools, built once at startup
    pub tools: Arc<ToolRegistry>,
    /// Logger handed to the snapshot lifecycle; `None` gives each hub a
    /// `TracingSnapshotLogger` tagged with its session id
    pub snapshot_logger: Option<Arc<dyn SnapshotLogger>>,
    /// Behaviour when the pre-capture scrub fails
    pub snapshot_failure_mode: FailureMode,
}

/// Runtime authority for one session
pub struct SessionHub {
    session: Session,
    deps: HubDeps,
    sandbox: Option<SandboxHandle>,
    snapshot_logger: Arc<dyn SnapshotLogger>,
    cancellation: CancellationToken,
    events: broadcast::Sender<HubEvent>,
    env_scrubbed: bool,
}

impl SessionHub {
    /// Create a hub for `session`; call [`SessionHub::attach`] before use
    #[must_use]
    pub fn new(
        session: Session,
        deps: HubDeps,
        cancellation: CancellationToken,
        events: broadcast::Sender<HubEvent>,
    ) -> Self {
        let snapshot_logger: Arc<dyn SnapshotLogger> = match &deps.snapshot_logger {
            Some(logger) => Arc::clone(logger),
            None => Arc::new(TracingSnapshotLogger::for_session(session.id.clone())),
        };
        Self {
            session,
            deps,
            sandbox: None,
            snapshot_logger,
            cancellation,
            events,
            env_scrubbed: false,
        }
    }

    /// In-memory projection of the session
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.session.status
    }

    /// Whether a snapshot left the env files scrubbed and unrestored
    #[must_use]
    pub const fn env_scrubbed(&self) -> bool {
        self.env_scrubbed
    }

    /// Whether a sandbox handle is bound
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Stop signal threaded into every sandbox call
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Bind a sandbox handle and move the session to `running`.
    ///
    /// # Errors
    ///
    /// Returns `HubError::SandboxUnavailable` if the provider rejects; the
    /// session is then persisted as `failed`.
    #[instrument(skip(self), fields(session_id = %self.session.id))]
    pub async fn attach(&mut self, sandbox_id: &str) -> Result<(), HubError> {
        if self.session.status != SessionStatus::Creating || self.sandbox.is_some() {
            return Err(HubError::InvalidState {
                operation: "attach",
                status: self.session.status,
            });
        }

        match SandboxHandle::attach(
            Arc::clone(&self.deps.provider),
            sandbox_id,
            self.cancellation.clone(),
        )
        .await
        {
            Ok(handle) => {
                self.sandbox = Some(handle);
                self.transition(SessionStatus::Running).await
            }
            Err(e) => {
                warn!(sandbox_id, error = %e, "Sandbox attach rejected");
                self.transition(SessionStatus::Failed).await?;
                Err(HubError::SandboxUnavailable(e.to_string()))
            }
        }
    }

    /// Suspend the sandbox
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless running, or the provider's error.
    pub async fn pause(&mut self) -> Result<(), HubError> {
        self.require(SessionStatus::Running, "pause")?;
        self.handle()?.pause().await?;
        self.transition(SessionStatus::Paused).await
    }

    /// Resume a paused sandbox
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless paused, or the provider's error.
    pub async fn resume(&mut self) -> Result<(), HubError> {
        self.require(SessionStatus::Paused, "resume")?;
        self.handle()?.resume().await?;
        self.transition(SessionStatus::Running).await
    }

    /// Route one agent tool call.
    ///
    /// Intercepted tools run here and their arguments never reach the
    /// sandbox. Everything else is forwarded and the sandbox's answer relayed
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless running, or the sandbox error of a
    /// forwarded call. Intercepted tool faults never surface as errors.
    pub async fn dispatch_tool_call(
        &mut self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolResponse, HubError> {
        self.require(SessionStatus::Running, "call tools")?;

        if let Some(tool) = self.deps.tools.get(name) {
            debug!(session_id = %self.session.id, tool = name, "Executing intercepted tool");
            let outcome = match tool.execute(self, args).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        session_id = %self.session.id,
                        tool = name,
                        error = %e,
                        "Intercepted tool failed unexpectedly"
                    );
                    ToolOutcome::failure(format!("Tool {name} failed unexpectedly"))
                }
            };
            return Ok(ToolResponse::Intercepted(outcome));
        }

        debug!(
            session_id = %self.session.id,
            tool = name,
            args = %truncate_str(args.to_string(), 200),
            "Forwarding tool call to sandbox"
        );
        let response = self
            .handle()?
            .forward_tool_call(name, &args, Duration::from_secs(TOOL_CALL_TIMEOUT_SECS))
            .await?;
        Ok(ToolResponse::Forwarded(response))
    }

    /// Scrub, capture, then run the cleanup guard on every exit path.
    ///
    /// A paused sandbox cannot run the scrub, so it is resumed for the whole
    /// scrub/capture/re-apply cycle and paused again afterwards. If the
    /// re-pause fails the session is recorded as `running`.
    ///
    /// # Errors
    ///
    /// Returns `Snapshot` when preparation fails (capture is never attempted),
    /// `CaptureFailed` after the guard has run, or the provider's error when a
    /// paused sandbox cannot be resumed.
    #[instrument(skip(self), fields(session_id = %self.session.id))]
    pub async fn request_snapshot(
        &mut self,
        configuration_id: Option<&str>,
        reapply: bool,
    ) -> Result<SnapshotImage, HubError> {
        let was_paused = match self.session.status {
            SessionStatus::Running => false,
            SessionStatus::Paused => true,
            status => {
                return Err(HubError::InvalidState {
                    operation: "snapshot",
                    status,
                })
            }
        };

        if was_paused {
            self.handle()?.resume().await?;
            debug!(session_id = %self.session.id, "Sandbox resumed for snapshot");
        }

        let result = self.capture_with_cleanup(configuration_id, reapply).await;

        if was_paused {
            if let Err(e) = self.handle()?.pause().await {
                warn!(
                    session_id = %self.session.id,
                    error = %e,
                    "Failed to re-pause sandbox after snapshot"
                );
                self.transition(SessionStatus::Running).await?;
            }
        }
        result
    }

    async fn capture_with_cleanup(
        &mut self,
        configuration_id: Option<&str>,
        reapply: bool,
    ) -> Result<SnapshotImage, HubError> {
        let handle = self.handle()?;

        let guard = prepare_for_snapshot(SnapshotPrepareOptions {
            provider: Arc::clone(handle.provider()),
            catalog: Arc::clone(&self.deps.catalog),
            sandbox_id: handle.sandbox_id().to_string(),
            configuration_id: configuration_id.map(str::to_string),
            logger: Arc::clone(&self.snapshot_logger),
            log_context: format!("session {}", self.session.id),
            failure_mode: self.deps.snapshot_failure_mode,
            reapply_after_capture: reapply,
            cancellation: Some(self.cancellation.clone()),
        })
        .await?;

        let captured = handle
            .capture(Duration::from_secs(SNAPSHOT_CAPTURE_TIMEOUT_SECS))
            .await;
        let restored = guard.apply().await;

        if guard.scrubbed() {
            self.env_scrubbed = !restored;
            if !restored {
                warn!(
                    session_id = %self.session.id,
                    "Env files remain scrubbed in the running sandbox"
                );
            }
        }

        let image = captured.map_err(|e| HubError::CaptureFailed(e.to_string()))?;
        info!(session_id = %self.session.id, image_id = %image.image_id, "Snapshot captured");
        Ok(image)
    }

    /// Record a provider-reported crash: the session goes straight to `failed`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the status cannot be persisted.
    pub async fn handle_provider_crash(&mut self, reason: &str) -> Result<(), HubError> {
        if self.session.status.is_terminal() {
            return Ok(());
        }
        error!(session_id = %self.session.id, reason, "Sandbox provider reported a crash");
        if self.env_scrubbed {
            warn!(
                session_id = %self.session.id,
                "Sandbox crashed with env files scrubbed and not re-applied"
            );
        }
        self.transition(SessionStatus::Failed).await
    }

    /// Tear down the sandbox and persist the final status.
    ///
    /// Ends in `stopped` when teardown succeeds, `failed` otherwise. A session
    /// that is already terminal keeps its status.
    ///
    /// # Errors
    ///
    /// Returns the store error if a status cannot be persisted.
    #[instrument(skip(self), fields(session_id = %self.session.id))]
    pub async fn close(&mut self) -> Result<(), HubError> {
        if !self.session.status.is_terminal() {
            self.transition(SessionStatus::Stopping).await?;
        }

        let released = match self.sandbox.take() {
            Some(handle) => handle.release().await,
            None => Ok(()),
        };

        if self.session.status == SessionStatus::Stopping {
            let last = if released.is_ok() {
                SessionStatus::Stopped
            } else {
                SessionStatus::Failed
            };
            self.transition(last).await?;
        }
        info!(status = %self.session.status, "Session hub closed");
        Ok(())
    }

    /// Publish an event to every subscriber
    pub(crate) fn emit(&self, event: HubEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn transition(&mut self, to: SessionStatus) -> Result<(), HubError> {
        let from = self.session.status;
        if !from.can_transition_to(to) {
            return Err(HubError::InvalidTransition { from, to });
        }
        // Store first: memory never runs ahead of the committed row
        self.deps.store.update_status(&self.session.id, to).await?;
        self.session.status = to;
        info!(session_id = %self.session.id, %from, %to, "Session status changed");
        self.emit(HubEvent::StatusChanged { from, to });
        Ok(())
    }

    fn require(&self, status: SessionStatus, operation: &'static str) -> Result<(), HubError> {
        if self.session.status == status {
            Ok(())
        } else {
            Err(HubError::InvalidState {
                operation,
                status: self.session.status,
            })
        }
    }

    fn handle(&self) -> Result<&SandboxHandle, HubError> {
        self.sandbox.as_ref().ok_or(HubError::NotAttached)
    }
}
