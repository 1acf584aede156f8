//! Mapping of data-access errors to HTTP responses.

use crate::error::DbError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, info};

/// An error response with a JSON body of the form `{"message": "..."}`.
///
/// Only server errors carry no detail: the full error is logged instead.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(detail: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("bad request: {detail}"))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match &err {
            DbError::NotFound => {
                info!(error = %err, "Entity not found");
                Self::new(StatusCode::NOT_FOUND, "not found")
            }
            DbError::DuplicateKey(_) => {
                info!(error = %err, "Duplicate entity");
                Self::new(StatusCode::CONFLICT, "duplicate entity")
            }
            DbError::InvalidInput { message } => {
                info!(error = %err, "Bad request");
                Self::bad_request(message)
            }
            _ => {
                error!(error = %err, error_debug = ?err, "Internal server error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}
