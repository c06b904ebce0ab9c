//! Server error type.
//!
//! Every handler returns `Result<T, ServerError>`. All failures map to
//! `500 {"error": "<message>"}`; clients tell them apart by message only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ember_core::EngineError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The blocking worker panicked or was cancelled
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match &self {
            ServerError::Engine(e) => error!(error = %e, "request failed"),
            ServerError::Worker(e) => error!(error = ?e, "worker task failed"),
        }
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_engine_errors_become_500_json() {
        let response = ServerError::from(EngineError::IndexNotReady).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "No directory has been indexed yet");
    }
}
