//! Live hub registry
//!
//! Tracks running hubs by session id and enforces that a sandbox id maps to
//! at most one live hub. Entries disappear when the hub's loop exits.

use super::{HubDeps, HubError, HubHandle};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Default)]
struct RegistryState {
    by_session: HashMap<String, HubHandle>,
    // sandbox id -> owning session id
    sandbox_owner: HashMap<String, String>,
}

/// Process-wide map of live session hubs
#[derive(Default)]
pub struct HubRegistry {
    state: RwLock<RegistryState>,
}

impl HubRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a brand-new `session` and start its hub.
    ///
    /// The sandbox is reserved before the row is written, so a request that
    /// loses the race for a sandbox leaves nothing behind in the store.
    ///
    /// # Errors
    ///
    /// Returns `SandboxInUse` if another live hub owns the sandbox, the
    /// store error if the row cannot be written, or the attach error.
    pub async fn create(
        self: &Arc<Self>,
        session: Session,
        deps: HubDeps,
        queue_capacity: usize,
    ) -> Result<HubHandle, HubError> {
        self.reserve(&session).await?;
        if let Err(e) = deps.store.insert_session(session.clone()).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist new session");
            self.release(&session.sandbox_id).await;
            return Err(e.into());
        }
        self.launch(session, deps, queue_capacity).await
    }

    /// Start a hub for an already persisted `session`, reserving its sandbox first.
    ///
    /// # Errors
    ///
    /// Returns `SandboxInUse` if another live hub owns the sandbox,
    /// `SessionActive` if the session already has a hub, or the attach error.
    pub async fn start(
        self: &Arc<Self>,
        session: Session,
        deps: HubDeps,
        queue_capacity: usize,
    ) -> Result<HubHandle, HubError> {
        self.reserve(&session).await?;
        self.launch(session, deps, queue_capacity).await
    }

    async fn reserve(&self, session: &Session) -> Result<(), HubError> {
        let mut state = self.state.write().await;
        if state.by_session.contains_key(&session.id) {
            return Err(HubError::SessionActive(session.id.clone()));
        }
        if let Some(owner) = state.sandbox_owner.get(&session.sandbox_id) {
            return Err(HubError::SandboxInUse {
                sandbox_id: session.sandbox_id.clone(),
                owner: owner.clone(),
            });
        }
        state
            .sandbox_owner
            .insert(session.sandbox_id.clone(), session.id.clone());
        Ok(())
    }

    async fn release(&self, sandbox_id: &str) {
        self.state.write().await.sandbox_owner.remove(sandbox_id);
    }

    // Caller holds the sandbox reservation
    async fn launch(
        self: &Arc<Self>,
        session: Session,
        deps: HubDeps,
        queue_capacity: usize,
    ) -> Result<HubHandle, HubError> {
        let session_id = session.id.clone();
        let sandbox_id = session.sandbox_id.clone();

        let (handle, task) = match HubHandle::spawn(session, deps, queue_capacity).await {
            Ok(started) => started,
            Err(e) => {
                self.release(&sandbox_id).await;
                return Err(e);
            }
        };

        self.state
            .write()
            .await
            .by_session
            .insert(session_id.clone(), handle.clone());

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(session_id = %session_id, error = %e, "Session hub task panicked");
            }
            registry.remove(&session_id, &sandbox_id).await;
        });

        Ok(handle)
    }

    /// Handle for a live hub
    pub async fn get(&self, session_id: &str) -> Option<HubHandle> {
        self.state.read().await.by_session.get(session_id).cloned()
    }

    /// Whether a live hub owns `sandbox_id`
    pub async fn contains_sandbox(&self, sandbox_id: &str) -> bool {
        self.state
            .read()
            .await
            .sandbox_owner
            .contains_key(sandbox_id)
    }

    /// Trip the hub's stop signal without waiting for its queue (lock-free for the hub)
    ///
    /// Returns `true` if cancellation was requested, `false` if no hub found
    pub async fn cancel(&self, session_id: &str) -> bool {
        if let Some(handle) = self.get(session_id).await {
            handle.cancel();
            info!(session_id, "Cancellation requested for session hub");
            true
        } else {
            warn!(session_id, "No live hub found for session");
            false
        }
    }

    /// Ask the hub to stop after its queued commands
    ///
    /// Returns `false` if no hub found
    pub async fn stop(&self, session_id: &str) -> bool {
        let Some(handle) = self.get(session_id).await else {
            return false;
        };
        handle.stop().await.is_ok()
    }

    /// Number of live hubs
    pub async fn len(&self) -> usize {
        self.state.read().await.by_session.len()
    }

    /// Whether no hubs are live
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.by_session.is_empty()
    }

    async fn remove(&self, session_id: &str, sandbox_id: &str) {
        let mut state = self.state.write().await;
        state.by_session.remove(session_id);
        if state.sandbox_owner.get(sandbox_id).map(String::as_str) == Some(session_id) {
            state.sandbox_owner.remove(sandbox_id);
        }
        info!(session_id, sandbox_id, "Session hub removed from registry");
    }
}
