//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON `{"error": ..}`
//! body with an appropriate status code.
//!
//! Internal errors are logged with full detail but only a generic message is
//! returned, so file paths never leak to clients.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use splat_core::{ErrorKind, RuntimeError};
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the splat-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the job runtime.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<MultipartError> for ServerError {
    fn from(e: MultipartError) -> Self {
        ServerError::BadRequest(e.body_text())
    }
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Runtime(e) => match e.kind() {
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let client_message = match &self {
            ServerError::NotFound(m) | ServerError::BadRequest(m) => m.clone(),
            ServerError::Runtime(e) if status.is_server_error() => {
                error!(error = %e, "runtime error");
                "internal server error".to_owned()
            }
            ServerError::Runtime(e) => e.to_string(),
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
