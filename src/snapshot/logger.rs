//! Structured logging contract for the snapshot lifecycle
//!
//! Error payloads carry the failure's message text and nothing else. There is
//! no field for command stdout/stderr: scrub output can echo secret values.

use serde::Serialize;
use tracing::{error, info};

/// Error object attached to a lifecycle error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggedError {
    /// Human-readable failure message
    pub message: String,
}

/// Payload of a lifecycle error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotLogPayload {
    /// The failure
    pub error: LoggedError,
}

impl SnapshotLogPayload {
    /// Payload carrying only `message`
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            error: LoggedError {
                message: message.into(),
            },
        }
    }
}

/// Logger consumed by the snapshot lifecycle manager
pub trait SnapshotLogger: Send + Sync {
    /// Progress message
    fn info(&self, message: &str);
    /// Failure with a structured payload
    fn error(&self, payload: &SnapshotLogPayload, message: &str);
}

/// Forwards lifecycle logs to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingSnapshotLogger {
    session_id: Option<String>,
}

impl TracingSnapshotLogger {
    /// Logger tagging every event with `session_id`
    #[must_use]
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }
}

impl SnapshotLogger for TracingSnapshotLogger {
    fn info(&self, message: &str) {
        info!(session_id = self.session_id.as_deref(), "{message}");
    }

    fn error(&self, payload: &SnapshotLogPayload, message: &str) {
        error!(
            session_id = self.session_id.as_deref(),
            error = %payload.error.message,
            "{message}"
        );
    }
}
