// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Upstream API error: {0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Failure kinds of the import pipeline.
///
/// The `Display` text is what gets persisted on file and import records and
/// surfaced to users, so it must stay free of internal detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("Could not read activity file: {0}")]
    Parse(String),

    #[error("Failed to queue job: {0}")]
    Publish(String),

    #[error("Could not open archive: {0}")]
    ArchiveOpen(String),

    #[error("Timed out waiting for imported statuses to attach archive media")]
    MediaRetryExhausted,

    #[error("Archive owner {0} no longer exists")]
    ActorMissing(String),

    #[error("Refusing to fetch media from non-public target: {0}")]
    UnsafeMediaTarget(String),
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Publish(msg) => AppError::Queue(msg),
            ImportError::ActorMissing(actor) => AppError::NotFound(format!("Actor {}", actor)),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl AppError {
    /// Whether a queue callback hitting this error should be redelivered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Upstream(_) | AppError::Internal(_)
        )
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Queue(msg) => {
                tracing::error!(error = %msg, "Queue error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue_error",
                    Some("Could not schedule the import, please try again".to_string()),
                )
            }
            AppError::Upstream(msg) => {
                tracing::error!(error = %msg, "Upstream API error");
                (StatusCode::BAD_GATEWAY, "upstream_error", None)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
