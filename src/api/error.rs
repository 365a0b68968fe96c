use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::ingest::IngestError;
use crate::store::StoreError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - A required field is absent or empty.
    MissingField(&'static str),
    /// 404 - No command with this id.
    CommandNotFound(String),
    /// 404 - No incident with this id.
    IncidentNotFound(String),
    /// 413 - Request body above the route's ceiling.
    PayloadTooLarge,
    /// 503 - Agent socket limit reached.
    TooManyConnections,
    /// 500 - The store rejected a write or read.
    StoreFailed(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            ApiError::CommandNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::IncidentNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::StoreFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::MissingField(_) => "missing_field",
            ApiError::CommandNotFound(_) => "command_not_found",
            ApiError::IncidentNotFound(_) => "incident_not_found",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::TooManyConnections => "too_many_connections",
            ApiError::StoreFailed(_) => "store_failed",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header or ?token= query parameter.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::MissingField(field) => format!("Missing required field: {}.", field),
            ApiError::CommandNotFound(id) => format!("Command not found: {}.", id),
            ApiError::IncidentNotFound(id) => format!("Incident not found: {}.", id),
            ApiError::PayloadTooLarge => "Request body exceeds the size limit.".to_string(),
            ApiError::TooManyConnections => {
                "Too many agent connections. Try again shortly.".to_string()
            }
            ApiError::StoreFailed(_) => "Storage operation failed.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message(),
            "code": self.code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "store failure");
        ApiError::StoreFailed(e.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::MissingField(field) => ApiError::MissingField(field),
            IngestError::Invalid(detail) => ApiError::InvalidRequest(detail),
            IngestError::IncidentNotFound(id) => ApiError::IncidentNotFound(id),
            IngestError::Store(e) => e.into(),
        }
    }
}

/// Malformed JSON bodies become 400s, not axum's default 422. Bodies over
/// the limit keep their 413.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::PayloadTooLarge;
        }
        ApiError::InvalidRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: convert an ApiError into a response and extract the status and
    /// parsed JSON body.
    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn body_is_flat_error_and_code() {
        let (status, json) = response_parts(ApiError::MissingField("agent_id")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "missing_field");
        assert_eq!(json["error"], "Missing required field: agent_id.");
    }

    #[tokio::test]
    async fn auth_statuses() {
        assert_eq!(response_parts(ApiError::AuthRequired).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(response_parts(ApiError::AuthInvalid).await.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn not_found_statuses() {
        let (status, json) = response_parts(ApiError::CommandNotFound("c-1".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "command_not_found");
        let (status, _) = response_parts(ApiError::IncidentNotFound("i-1".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn store_failure_hides_detail() {
        let (status, json) = response_parts(ApiError::StoreFailed("disk I/O error".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "store_failed");
        assert!(!json["error"].as_str().unwrap().contains("disk"));
    }

    #[tokio::test]
    async fn payload_too_large_status() {
        let (status, json) = response_parts(ApiError::PayloadTooLarge).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["code"], "payload_too_large");
    }

    #[tokio::test]
    async fn too_many_connections_status() {
        let (status, _) = response_parts(ApiError::TooManyConnections).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn ingest_errors_map_to_api_errors() {
        let e: ApiError = IngestError::MissingField("command_id").into();
        assert_eq!(e.code(), "missing_field");
        let e: ApiError = IngestError::Invalid("bad".into()).into();
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        let e: ApiError = IngestError::IncidentNotFound("i".into()).into();
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
        let e: ApiError = IngestError::Store(StoreError::Corrupt("x".into())).into();
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
