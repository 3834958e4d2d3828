use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sandbox_gateway_core::sandbox::SandboxError;
use serde::Serialize;

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message
    pub error: String,
}

/// Errors returned by the control surface
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A lifecycle operation failed
    #[error("{0}")]
    Sandbox(#[from] SandboxError),
    /// Termination failed; reported as a server error whatever the cause
    #[error("{0}")]
    Terminate(SandboxError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Sandbox(SandboxError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Sandbox(
                SandboxError::Provision(_) | SandboxError::Runtime(_) | SandboxError::Exec(_),
            )
            | Self::Terminate(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (code, Json(body)).into_response()
    }
}
