//! HTTP surface
//!
//! Public routes: `/health` and the billing refresh endpoint. Control routes
//! (session creation, stop, revocation, the client socket) require the
//! configured control bearer token; with no token configured they are closed.

mod ws;

use crate::billing::{self, BillingError, BillingTokenService};
use crate::hub::{HubDeps, HubError, HubRegistry};
use crate::session::{Session, StoreError};
use axum::extract::{FromRef, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    /// Billing token service
    pub billing: Arc<BillingTokenService>,
    /// Live hubs
    pub hubs: Arc<HubRegistry>,
    /// Collaborators handed to new hubs
    pub hub_deps: HubDeps,
    /// Bearer token guarding control routes
    pub control_token: Option<Arc<str>>,
    /// Per-hub command queue size
    pub hub_queue_capacity: usize,
}

impl FromRef<AppState> for Arc<BillingTokenService> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.billing)
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/{session_id}/stop", post(stop_session_handler))
        .route(
            "/api/sessions/{session_id}/billing-token/revoke",
            post(revoke_handler),
        )
        .route("/sessions/{session_id}/ws", get(ws::session_ws_handler))
        .merge(billing::router())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn hub_error_response(err: &HubError) -> Response {
    let status = match err {
        HubError::SandboxInUse { .. } | HubError::SessionActive(_) => StatusCode::CONFLICT,
        HubError::SandboxUnavailable(_) => StatusCode::BAD_GATEWAY,
        HubError::InvalidState { .. } | HubError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
        warn!(error = %err, "Hub request failed");
        return error_response(status, "internal error");
    }
    error_response(status, err.to_string())
}

#[allow(clippy::result_large_err)]
fn authorize_control(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.control_token.as_deref() else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "control API disabled",
        ));
    };
    match billing::bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized")),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    organization_id: String,
    sandbox_id: String,
    #[serde(default)]
    configuration_id: Option<String>,
}

async fn create_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    if let Err(resp) = authorize_control(&state, &headers) {
        return resp;
    }
    let session = Session::new(body.organization_id, body.sandbox_id, body.configuration_id);
    let session_id = session.id.clone();
    let org_id = session.organization_id.clone();
    let token_version = session.billing_token_version;

    let hub = match state
        .hubs
        .create(session, state.hub_deps.clone(), state.hub_queue_capacity)
        .await
    {
        Ok(hub) => hub,
        Err(e) => return hub_error_response(&e),
    };

    let token = match state.billing.mint(&org_id, &session_id, token_version) {
        Ok(token) => token,
        Err(e) => return e.into_response(),
    };

    info!(session_id = %session_id, sandbox_id = %hub.sandbox_id(), "Session created");
    (
        StatusCode::CREATED,
        Json(json!({
            "session_id": session_id,
            "sandbox_id": hub.sandbox_id(),
            "billing_token": token,
        })),
    )
        .into_response()
}

async fn stop_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize_control(&state, &headers) {
        return resp;
    }
    if state.hubs.stop(&session_id).await {
        (StatusCode::ACCEPTED, Json(json!({ "session_id": session_id }))).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "no live hub for session")
    }
}

async fn revoke_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize_control(&state, &headers) {
        return resp;
    }
    match state.billing.revoke(&session_id).await {
        Ok(version) => Json(json!({ "token_version": version })).into_response(),
        Err(BillingError::Store(StoreError::Conflict(_))) => {
            error_response(StatusCode::CONFLICT, "concurrent revocation, retry")
        }
        Err(e) => e.into_response(),
    }
}
