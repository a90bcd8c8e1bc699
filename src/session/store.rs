//! Persistence seam for session rows
//!
//! The real persistence layer lives outside this crate; `SessionStore` is the
//! slice of it the hub and billing service consume. `InMemorySessionStore`
//! backs the binary and the integration tests.

use super::{Session, SessionStatus};
use crate::config::TOKEN_VERSION_CAS_ATTEMPTS;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors that can occur during store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Session row does not exist
    #[error("session not found: {0}")]
    NotFound(String),
    /// Session row already exists
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    /// Compare-and-set kept losing to concurrent writers
    #[error("concurrent update conflict on session {0}")]
    Conflict(String),
    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Interface for session persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session row
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    /// Insert a new session row
    async fn insert_session(&self, session: Session) -> Result<(), StoreError>;
    /// Persist a status transition
    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError>;
    /// Atomically replace the token version if it still equals `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_set_token_version(
        &self,
        session_id: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError>;
}

/// Increment a session's billing token version through compare-and-set.
///
/// Concurrent callers each land exactly one increment; a caller that keeps
/// losing the race gives up with `StoreError::Conflict`.
///
/// # Errors
///
/// Returns `StoreError::NotFound` for unknown sessions, `Conflict` after
/// exhausting retries, or any backend error.
pub async fn bump_token_version(
    store: &dyn SessionStore,
    session_id: &str,
) -> Result<u64, StoreError> {
    for attempt in 1..=TOKEN_VERSION_CAS_ATTEMPTS {
        let session = store
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let current = session.billing_token_version;
        let next = current.saturating_add(1);

        if store
            .compare_and_set_token_version(session_id, current, next)
            .await?
        {
            debug!(session_id, version = next, "Billing token version bumped");
            return Ok(next);
        }
        warn!(session_id, attempt, "Token version compare-and-set lost a race");
    }
    Err(StoreError::Conflict(session_id.to_string()))
}

/// In-process session store
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.status = status;
        Ok(())
    }

    async fn compare_and_set_token_version(
        &self,
        session_id: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        // Version never moves backwards, even for a matching expected value
        if session.billing_token_version != expected || new <= expected {
            return Ok(false);
        }
        session.billing_token_version = new;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(id: &str) -> Session {
        Session::new("org-1", format!("sandbox-{id}"), None).with_id(id)
    }

    #[tokio::test]
    async fn insert_twice_is_rejected() -> Result<(), StoreError> {
        let store = InMemorySessionStore::new();
        store.insert_session(session("s-1")).await?;
        let err = store.insert_session(session("s-1")).await;
        assert_eq!(err, Err(StoreError::AlreadyExists("s-1".to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn cas_refuses_stale_and_backwards_updates() -> Result<(), StoreError> {
        let store = InMemorySessionStore::new();
        store.insert_session(session("s-1")).await?;

        assert!(!store.compare_and_set_token_version("s-1", 7, 8).await?);
        assert!(!store.compare_and_set_token_version("s-1", 1, 1).await?);
        assert!(store.compare_and_set_token_version("s-1", 1, 2).await?);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_bumps_never_lose_an_increment() -> Result<(), StoreError> {
        let store = Arc::new(InMemorySessionStore::new());
        store.insert_session(session("s-1")).await?;

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                bump_token_version(store.as_ref(), "s-1").await
            }));
        }
        let mut versions = Vec::new();
        for task in tasks {
            if let Ok(result) = task.await {
                versions.push(result?);
            }
        }
        versions.sort_unstable();
        assert_eq!(versions, vec![2, 3, 4, 5]);

        let stored = store.get_session("s-1").await?.map(|s| s.billing_token_version);
        assert_eq!(stored, Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn bump_gives_up_after_repeated_conflicts() {
        let mut store = MockSessionStore::new();
        store
            .expect_get_session()
            .returning(|id| Ok(Some(session(id))));
        store
            .expect_compare_and_set_token_version()
            .times(TOKEN_VERSION_CAS_ATTEMPTS)
            .returning(|_, _, _| Ok(false));

        let result = bump_token_version(&store, "s-1").await;
        assert_eq!(result, Err(StoreError::Conflict("s-1".to_string())));
    }

    #[tokio::test]
    async fn bump_unknown_session_is_not_found() {
        let store = InMemorySessionStore::new();
        let result = bump_token_version(&store, "missing").await;
        assert_eq!(result, Err(StoreError::NotFound("missing".to_string())));
    }
}
