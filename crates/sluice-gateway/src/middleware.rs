use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::state::AppState;

/// Extractor that checks the Bearer token when the gateway has one.
pub struct Authenticated;

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        let result = match state.config.token.as_deref() {
            None => Ok(Authenticated),
            Some(expected) if bearer == Some(expected) => Ok(Authenticated),
            Some(_) => Err(StatusCode::UNAUTHORIZED),
        };

        async move { result }
    }
}
