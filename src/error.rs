use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to decode request body: {0}")]
    Wire(#[from] serde_json::Error),

    #[error("client '{0}' is not managed")]
    UnknownAgent(String),

    #[error("client '{0}' doesn't have a results queue")]
    MissingQueue(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::UnknownAgent(_) => StatusCode::NOT_FOUND,
            // Wire payload parse errors are reported as 500 so the sender
            // retries on its next cycle instead of treating the request as
            // permanently rejected.
            AppError::Wire(_) | AppError::MissingQueue(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = json!({
            "error": self.to_string()
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
