use super::{BillingError, BillingTokenService};
use axum::extract::{FromRef, Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

/// Build the billing router with `/api/sessions/{session_id}/billing-token/refresh`
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    Arc<BillingTokenService>: FromRef<S>,
{
    Router::new().route(
        "/api/sessions/{session_id}/billing-token/refresh",
        post(refresh_handler),
    )
}

/// Token from an `Authorization: Bearer ...` header
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn refresh_handler(
    State(service): State<Arc<BillingTokenService>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, BillingError> {
    let token = bearer_token(&headers).ok_or(BillingError::MissingToken)?;
    let token = service.refresh(token, &session_id).await?;
    Ok(Json(json!({ "token": token })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok.en"));
        assert_eq!(bearer_token(&headers), Some("tok.en"));
    }
}
