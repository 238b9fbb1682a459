use crate::engine::EngineError;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rollcall_store::StoreError;
use serde_json::json;
use thiserror::Error;

/// Handler failure. Client mistakes get a 4xx with a short message; anything
/// else is logged and reported as a generic server error.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("multipart: {0}")]
    Multipart(#[from] MultipartError),
    #[error("multipart: {0}")]
    MultipartRejection(#[from] MultipartRejection),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            ApiError::Multipart(e) => (e.status(), e.body_text()),
            ApiError::MultipartRejection(e) => (e.status(), e.body_text()),
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "server error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
