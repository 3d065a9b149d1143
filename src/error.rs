//! Error taxonomy for the sidecar HTTP contract.
//!
//! Component functions (ingest, query, aligner, ...) return `anyhow::Result`,
//! matching the rest of the crate. At the HTTP boundary these are mapped
//! into [`ApiError`], which carries the stable error codes of the sidecar
//! contract and renders the versioned error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::server::API_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Validation(m)
            | ApiError::Unauthorized(m)
            | ApiError::Internal(m) => m.clone(),
        }
    }

    /// Render the same error envelope the HTTP contract uses, for callers
    /// (the CLI façade) that need the JSON body without an HTTP response.
    pub fn envelope(&self) -> serde_json::Value {
        let code = self.code();
        json!({
            "ok": false,
            "api_version": API_VERSION,
            "status": "error",
            "error": {"type": code, "message": self.message()},
            "error_code": code,
            "error_message": self.message(),
        })
    }
}

/// Component functions signal domain errors through `anyhow::bail!` message
/// text rather than typed variants; this heuristic sorts them back into the
/// right HTTP error code at the boundary. Anything unrecognized is treated
/// as an internal error.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("not found") || msg.contains("does not exist") {
            ApiError::NotFound(msg)
        } else if msg.contains("must be")
            || msg.contains("unknown")
            || msg.contains("invalid")
            || msg.contains("requires at least")
        {
            ApiError::Validation(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}
