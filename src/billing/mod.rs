//! Billing token service
//!
//! Tokens are HS256 JWTs scoped to one (organization, session) pair. Only the
//! token version is persisted, on the session row; bumping it revokes every
//! outstanding token for that session at once.

mod routes;

pub(crate) use routes::bearer_token;
pub use routes::router;

use crate::config::BILLING_TOKEN_TTL_SECS;
use crate::session::{bump_token_version, SessionStatus, SessionStore, StoreError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Signed billing token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingClaims {
    /// Organization being billed
    pub org_id: String,
    /// Metered session
    pub session_id: String,
    /// Session token version at mint time
    pub token_version: u64,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
}

/// Billing verification and refresh failures
#[derive(Error, Debug)]
pub enum BillingError {
    /// No bearer token on the request
    #[error("missing billing token")]
    MissingToken,
    /// Malformed token or bad signature
    #[error("invalid billing token")]
    InvalidToken,
    /// Token past its expiry
    #[error("billing token expired")]
    Expired,
    /// Claims name a different session than the request path
    #[error("billing token does not match session")]
    SessionMismatch,
    /// Session row does not exist
    #[error("session not found")]
    SessionNotFound,
    /// Session is not running
    #[error("session is {0}, expected running")]
    InvalidState(SessionStatus),
    /// Claims name a different organization than the session
    #[error("billing token does not match organization")]
    OrgMismatch,
    /// Token version no longer matches the session
    #[error("billing token revoked")]
    TokenRevoked,
    /// Persistence failed
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    /// Token could not be signed
    #[error("failed to sign billing token: {0}")]
    Signing(String),
}

impl BillingError {
    /// HTTP status for client-facing rejection
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken | Self::Expired | Self::TokenRevoked => {
                StatusCode::UNAUTHORIZED
            }
            Self::SessionMismatch | Self::OrgMismatch => StatusCode::FORBIDDEN,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::InvalidState(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Mints, verifies, refreshes and revokes billing tokens
pub struct BillingTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
    store: Arc<dyn SessionStore>,
}

impl BillingTokenService {
    /// Create a service signing with `secret`
    #[must_use]
    pub fn new(secret: &[u8], store: Arc<dyn SessionStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl_secs: i64::try_from(BILLING_TOKEN_TTL_SECS).unwrap_or(i64::MAX),
            store,
        }
    }

    /// Mint a token expiring one hour from now
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Signing` if encoding fails.
    pub fn mint(
        &self,
        org_id: &str,
        session_id: &str,
        token_version: u64,
    ) -> Result<String, BillingError> {
        let now = chrono::Utc::now().timestamp();
        self.mint_with_times(org_id, session_id, token_version, now, now + self.ttl_secs)
    }

    pub(crate) fn mint_with_times(
        &self,
        org_id: &str,
        session_id: &str,
        token_version: u64,
        iat: i64,
        exp: i64,
    ) -> Result<String, BillingError> {
        let claims = BillingClaims {
            org_id: org_id.to_string(),
            session_id: session_id.to_string(),
            token_version,
            iat,
            exp,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| BillingError::Signing(e.to_string()))
    }

    /// Check signature and expiry
    ///
    /// # Errors
    ///
    /// Returns `Expired` for a lapsed token, `InvalidToken` for anything else.
    pub fn verify(&self, token: &str) -> Result<BillingClaims, BillingError> {
        jsonwebtoken::decode::<BillingClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => BillingError::Expired,
                _ => {
                    debug!(error = %e, "Billing token rejected");
                    BillingError::InvalidToken
                }
            })
    }

    /// Exchange a valid token for a fresh one with the same version.
    ///
    /// # Errors
    ///
    /// Checks run in order: signature/expiry, `SessionMismatch`,
    /// `SessionNotFound`, `InvalidState`, `OrgMismatch`, `TokenRevoked`.
    #[instrument(skip(self, token))]
    pub async fn refresh(&self, token: &str, session_id: &str) -> Result<String, BillingError> {
        let claims = self.verify(token)?;
        if claims.session_id != session_id {
            return Err(BillingError::SessionMismatch);
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(BillingError::SessionNotFound)?;

        if session.status != SessionStatus::Running {
            return Err(BillingError::InvalidState(session.status));
        }
        if session.organization_id != claims.org_id {
            warn!(session_id, "Billing refresh with foreign organization");
            return Err(BillingError::OrgMismatch);
        }
        if session.billing_token_version != claims.token_version {
            return Err(BillingError::TokenRevoked);
        }

        self.mint(&claims.org_id, session_id, claims.token_version)
    }

    /// Revoke all outstanding tokens for a session; returns the new version
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown sessions or the store error.
    #[instrument(skip(self))]
    pub async fn revoke(&self, session_id: &str) -> Result<u64, BillingError> {
        let version = bump_token_version(self.store.as_ref(), session_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => BillingError::SessionNotFound,
                other => BillingError::Store(other),
            })?;
        info!(session_id, version, "Billing tokens revoked");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySessionStore, MockSessionStore, Session};
    use proptest::prelude::*;

    const SECRET: &[u8] = b"test-billing-secret";

    async fn running_session(store: &InMemorySessionStore, id: &str) -> Result<(), StoreError> {
        store
            .insert_session(Session::new("org-1", format!("sandbox-{id}"), None).with_id(id))
            .await?;
        store.update_status(id, SessionStatus::Running).await
    }

    #[test]
    fn mint_then_verify_keeps_claims() -> Result<(), BillingError> {
        let service = BillingTokenService::new(SECRET, Arc::new(InMemorySessionStore::new()));
        let token = service.mint_with_times("org-1", "s-1", 7, 1_000, 4_000_000_000)?;

        let claims = service.verify(&token)?;
        assert_eq!(
            claims,
            BillingClaims {
                org_id: "org-1".to_string(),
                session_id: "s-1".to_string(),
                token_version: 7,
                iat: 1_000,
                exp: 4_000_000_000,
            }
        );
        Ok(())
    }

    #[test]
    fn expired_and_foreign_tokens_are_distinguished() -> Result<(), BillingError> {
        let service = BillingTokenService::new(SECRET, Arc::new(InMemorySessionStore::new()));
        let other = BillingTokenService::new(b"other-secret", Arc::new(InMemorySessionStore::new()));

        let expired = service.mint_with_times("org-1", "s-1", 1, 1_000, 2_000)?;
        let foreign = other.mint("org-1", "s-1", 1)?;

        assert!(matches!(service.verify(&expired), Err(BillingError::Expired)));
        assert!(matches!(service.verify(&foreign), Err(BillingError::InvalidToken)));
        assert!(matches!(service.verify("not-a-jwt"), Err(BillingError::InvalidToken)));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_checks_run_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(InMemorySessionStore::new());
        running_session(&store, "s-1").await?;
        store
            .insert_session(Session::new("org-1", "sandbox-2", None).with_id("s-2"))
            .await?;
        let service = BillingTokenService::new(SECRET, store.clone());

        let token = service.mint("org-1", "s-1", 1)?;
        assert!(matches!(
            service.refresh(&token, "s-2").await,
            Err(BillingError::SessionMismatch)
        ));

        let unknown = service.mint("org-1", "s-9", 1)?;
        assert!(matches!(
            service.refresh(&unknown, "s-9").await,
            Err(BillingError::SessionNotFound)
        ));

        let creating = service.mint("org-1", "s-2", 1)?;
        assert!(matches!(
            service.refresh(&creating, "s-2").await,
            Err(BillingError::InvalidState(SessionStatus::Creating))
        ));

        let foreign_org = service.mint("org-2", "s-1", 1)?;
        assert!(matches!(
            service.refresh(&foreign_org, "s-1").await,
            Err(BillingError::OrgMismatch)
        ));

        let refreshed = service.refresh(&token, "s-1").await?;
        assert_eq!(service.verify(&refreshed)?.token_version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn revoked_token_cannot_refresh() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(InMemorySessionStore::new());
        running_session(&store, "s-1").await?;
        let service = BillingTokenService::new(SECRET, store.clone());

        let token = service.mint("org-1", "s-1", 1)?;
        assert_eq!(service.revoke("s-1").await?, 2);

        assert!(matches!(
            service.refresh(&token, "s-1").await,
            Err(BillingError::TokenRevoked)
        ));
        let fresh = service.mint("org-1", "s-1", 2)?;
        assert!(service.refresh(&fresh, "s-1").await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn store_outage_is_a_server_error() -> Result<(), BillingError> {
        let mut store = MockSessionStore::new();
        store
            .expect_get_session()
            .returning(|_| Err(StoreError::Backend("connection reset".to_string())));
        let service = BillingTokenService::new(SECRET, Arc::new(store));

        let token = service.mint("org-1", "s-1", 1)?;
        let err = service.refresh(&token, "s-1").await.err();

        assert_eq!(
            err.map(|e| e.status_code()),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        Ok(())
    }

    #[test]
    fn rejections_map_to_http_statuses() {
        assert_eq!(BillingError::MissingToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(BillingError::TokenRevoked.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(BillingError::OrgMismatch.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(BillingError::SessionNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            BillingError::InvalidState(SessionStatus::Paused).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    proptest! {
        #[test]
        fn refresh_never_moves_the_stored_version(start in 1u64..1_000, refreshes in 1usize..5) {
            let runtime = tokio::runtime::Builder::new_current_thread().build()?;
            runtime.block_on(async {
                let store = Arc::new(InMemorySessionStore::new());
                let mut session = Session::new("org-1", "sandbox-1", None).with_id("s-1");
                session.status = SessionStatus::Running;
                session.billing_token_version = start;
                store.insert_session(session).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                let service = BillingTokenService::new(SECRET, store.clone());

                let mut token = service.mint("org-1", "s-1", start).map_err(|e| TestCaseError::fail(e.to_string()))?;
                for _ in 0..refreshes {
                    token = service.refresh(&token, "s-1").await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                }

                let stored = store.get_session("s-1").await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(stored.map(|s| s.billing_token_version), Some(start));
                prop_assert_eq!(service.verify(&token).map(|c| c.token_version).ok(), Some(start));
                Ok(())
            })?;
        }

        #[test]
        fn each_revocation_increments_by_one(revocations in 1u64..6) {
            let runtime = tokio::runtime::Builder::new_current_thread().build()?;
            runtime.block_on(async {
                let store = Arc::new(InMemorySessionStore::new());
                store
                    .insert_session(Session::new("org-1", "sandbox-1", None).with_id("s-1"))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let service = BillingTokenService::new(SECRET, store);

                let mut last = 1;
                for _ in 0..revocations {
                    let next = service.revoke("s-1").await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                    prop_assert_eq!(next, last + 1);
                    last = next;
                }
                Ok(())
            })?;
        }
    }
}
