//! Serialized command loop in front of a `SessionHub`
//!
//! Commands queue on a bounded mpsc channel and are handled one at a time in
//! arrival order. Events fan out on a broadcast channel to every subscriber
//! (the client socket and the agent).

use super::{HubDeps, HubError, SessionHub, ToolResponse};
use crate::session::{Session, SessionStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Inbound request for a hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubCommand {
    /// Agent tool call
    ToolCall {
        /// Correlates the result event
        call_id: String,
        /// Tool name
        name: String,
        /// Tool arguments
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Suspend the sandbox
    Pause,
    /// Resume the sandbox
    Resume,
    /// Capture the sandbox using the session's configuration
    Snapshot {
        /// Restore env files after capture
        #[serde(default = "default_reapply")]
        reapply: bool,
    },
    /// Graceful stop once earlier commands are handled
    Stop,
    /// Provider reported the sandbox died
    ProviderCrashed {
        /// Provider-supplied reason
        reason: String,
    },
}

const fn default_reapply() -> bool {
    true
}

/// Outbound notification from a hub
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// Committed status change
    StatusChanged {
        /// Previous status
        from: SessionStatus,
        /// New status
        to: SessionStatus,
    },
    /// Answer to a `ToolCall`
    ToolResult {
        /// Id from the originating command
        call_id: String,
        /// Tool response
        response: ToolResponse,
    },
    /// Snapshot captured
    SnapshotSaved {
        /// Captured image
        image_id: String,
    },
    /// Snapshot did not complete
    SnapshotFailed {
        /// Failure message
        message: String,
    },
    /// A command failed
    Error {
        /// Set when the failed command was a tool call
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        /// Failure message
        message: String,
    },
}

/// Cheap, cloneable front for a running hub
#[derive(Clone)]
pub struct HubHandle {
    session_id: String,
    sandbox_id: String,
    commands: mpsc::Sender<HubCommand>,
    events: broadcast::Sender<HubEvent>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("session_id", &self.session_id)
            .field("sandbox_id", &self.sandbox_id)
            .finish_non_exhaustive()
    }
}

impl HubHandle {
    /// Attach the session's sandbox and start the command loop.
    ///
    /// # Errors
    ///
    /// Returns the attach error; the session has been persisted as `failed`
    /// when the provider rejected it.
    pub async fn spawn(
        session: Session,
        deps: HubDeps,
        queue_capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), HubError> {
        let cancellation = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, receiver) = mpsc::channel(queue_capacity.max(1));

        let session_id = session.id.clone();
        let sandbox_id = session.sandbox_id.clone();
        let mut hub = SessionHub::new(session, deps, cancellation.clone(), events.clone());
        hub.attach(&sandbox_id).await?;

        let task = tokio::spawn(run(hub, receiver));
        info!(session_id = %session_id, sandbox_id = %sandbox_id, "Session hub started");

        Ok((
            Self {
                session_id,
                sandbox_id,
                commands,
                events,
                cancellation,
            },
            task,
        ))
    }

    /// Session this hub serves
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sandbox this hub owns
    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Queue a command
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` once the hub has shut down.
    pub async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Receive every event emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Stop after the commands already queued
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the hub is already gone.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.send(HubCommand::Stop).await
    }

    /// Interrupt the in-flight sandbox call and shut down without draining
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Wait until the command loop has exited and the final status is stored
    pub async fn closed(&self) {
        self.commands.closed().await;
    }
}

async fn run(mut hub: SessionHub, mut commands: mpsc::Receiver<HubCommand>) {
    let cancellation = hub.cancellation().clone();

    loop {
        let command = tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                warn!(session_id = %hub.session().id, "Session hub cancelled");
                break;
            }
            command = commands.recv() => command,
        };

        match command {
            None | Some(HubCommand::Stop) => break,
            Some(HubCommand::ProviderCrashed { reason }) => {
                if let Err(e) = hub.handle_provider_crash(&reason).await {
                    hub.emit(HubEvent::Error {
                        call_id: None,
                        message: e.to_string(),
                    });
                }
                break;
            }
            Some(command) => handle(&mut hub, command).await,
        }
    }

    if let Err(e) = hub.close().await {
        error!(session_id = %hub.session().id, error = %e, "Failed to close session hub");
    }
    // Receiver drops here, which is what `HubHandle::closed` waits on
}

async fn handle(hub: &mut SessionHub, command: HubCommand) {
    let mut failed_call = None;
    let result = match command {
        HubCommand::ToolCall {
            call_id,
            name,
            args,
        } => match hub.dispatch_tool_call(&name, args).await {
            Ok(response) => Ok(Some(HubEvent::ToolResult { call_id, response })),
            Err(e) => {
                failed_call = Some(call_id);
                Err(e)
            }
        },
        // Success is already reported as a status change
        HubCommand::Pause => hub.pause().await.map(|()| None),
        HubCommand::Resume => hub.resume().await.map(|()| None),
        HubCommand::Snapshot { reapply } => {
            let configuration_id = hub.session().configuration_id.clone();
            let event = match hub
                .request_snapshot(configuration_id.as_deref(), reapply)
                .await
            {
                Ok(image) => HubEvent::SnapshotSaved {
                    image_id: image.image_id,
                },
                Err(e) => HubEvent::SnapshotFailed {
                    message: e.to_string(),
                },
            };
            Ok(Some(event))
        }
        HubCommand::Stop | HubCommand::ProviderCrashed { .. } => return,
    };

    match result {
        Ok(Some(event)) => hub.emit(event),
        Ok(None) => {}
        Err(e) => {
            warn!(session_id = %hub.session().id, error = %e, "Hub command failed");
            hub.emit(HubEvent::Error {
                call_id: failed_call,
                message: e.to_string(),
            });
        }
    }
}
