use axum::{extract::Request, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Extract a `?token=` value from the query string. Browser agents cannot set
/// headers on a WebSocket handshake, so they authenticate this way.
fn extract_query_token(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(|v| v.to_string()))
    })
}

/// Auth middleware function.
///
/// The Bearer header wins when present; otherwise `?token=` is checked.
/// Missing credentials are a 401, wrong ones a 403.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = extract_bearer(&req).or_else(|| extract_query_token(&req));
    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())) => {
            Ok(next.run(req).await)
        }
        Some(_) => {
            tracing::debug!(path = %req.uri().path(), "rejected request with invalid token");
            Err(ApiError::AuthInvalid)
        }
        None => Err(ApiError::AuthRequired),
    }
}
