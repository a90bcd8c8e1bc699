//! Session model
//!
//! The `Session` row and its status state machine. Only a `SessionHub`
//! drives status transitions; the store persists what the hub commits.

mod store;

pub use store::{bump_token_version, InMemorySessionStore, SessionStore, StoreError};

#[cfg(test)]
pub use store::MockSessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Sandbox is being created or attached
    Creating,
    /// Sandbox attached and accepting traffic
    Running,
    /// Suspended by an explicit pause command
    Paused,
    /// Teardown in progress
    Stopping,
    /// Torn down cleanly
    Stopped,
    /// Sandbox lost or teardown failed
    Failed,
}

impl SessionStatus {
    /// Terminal statuses never transition again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the session state machine.
    ///
    /// `creating -> running -> {paused <-> running} -> stopping -> {stopped | failed}`,
    /// plus `failed` from any live state (provider crash).
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (
                    Self::Creating | Self::Running | Self::Paused,
                    Self::Stopping
                )
                | (Self::Stopping, Self::Stopped)
                | (
                    Self::Creating | Self::Running | Self::Paused | Self::Stopping,
                    Self::Failed
                )
        )
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end client/agent/sandbox session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: String,
    /// Owning organization
    pub organization_id: String,
    /// Current committed status
    pub status: SessionStatus,
    /// Sandbox bound to this session
    pub sandbox_id: String,
    /// Configuration whose secret files live in the sandbox
    pub configuration_id: Option<String>,
    /// Current billing token version; only ever increases
    pub billing_token_version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session in `creating` state with token version 1
    #[must_use]
    pub fn new(
        organization_id: impl Into<String>,
        sandbox_id: impl Into<String>,
        configuration_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            status: SessionStatus::Creating,
            sandbox_id: sandbox_id.into(),
            configuration_id,
            billing_token_version: 1,
            created_at: Utc::now(),
        }
    }

    /// Override the generated id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
