//! Error taxonomy for the service.
//!
//! [`StoreError`] is what the persistence and queue layers return.
//! [`AppError`] is what handlers return; it owns the mapping to HTTP status
//! codes so the routes never build error responses by hand.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::validation::ValidationIssue;

// ---

/// Failure talking to the reading store, rollup store or task broker.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored data: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{} invalid element(s) in request", .0.len())]
    Validation(Vec<ValidationIssue>),

    /// The body or query string could not be read into the expected shape.
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    #[error(transparent)]
    Unavailable(#[from] StoreError),
}

impl AppError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        AppError::NotFound {
            resource,
            id: id.into(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Malformed(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Malformed(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // ---
        match self {
            AppError::Validation(details) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": "validation_failed", "details": details })),
            )
                .into_response(),
            AppError::Malformed(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "error": "validation_failed",
                    "details": [{ "message": message }],
                })),
            )
                .into_response(),
            AppError::NotFound { resource, id } => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "resource": resource, "id": id })),
            )
                .into_response(),
            AppError::Unavailable(e) => {
                // Internal detail stays in the logs
                tracing::error!("Dependency failure: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "service_unavailable" })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_status_mapping() {
        // ---
        let issue = ValidationIssue {
            index: 0,
            field: Some("unit".to_string()),
            message: "missing field".to_string(),
        };
        assert_eq!(
            AppError::Validation(vec![issue]).into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::not_found("field", "unknown_field")
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(StoreError::Unavailable("down".to_string()))
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_malformed_is_unprocessable() {
        // ---
        let response = AppError::Malformed("expected a sequence".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_not_found_message_echoes_id() {
        // ---
        let err = AppError::not_found("sensor type", "pressure");
        assert_eq!(err.to_string(), "sensor type 'pressure' not found");
    }
}
