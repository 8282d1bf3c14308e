use crate::envelope::EnvelopeError;
use crate::secret::SecretError;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convert AppError to HTTP status codes for web responses
impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Envelope errors reaching this point come from sealing, never
            // from a caller-supplied passcode.
            Self::Envelope(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Secret(SecretError::NotFound) => StatusCode::NOT_FOUND,
            Self::Secret(SecretError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Secret(SecretError::ConcurrencyConflict { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to clients.
    fn public_message(&self) -> String {
        match self {
            Self::Secret(SecretError::NotFound) => "not found or expired".to_string(),
            Self::Secret(SecretError::StoreUnavailable(_)) => "secret store unavailable".to_string(),
            Self::Secret(SecretError::ConcurrencyConflict { .. }) => {
                "concurrent access, please retry".to_string()
            }
            Self::BadRequest(msg) | Self::PayloadTooLarge(msg) => msg.clone(),
            Self::Config(_) | Self::Envelope(_) | Self::Internal(_) => {
                "internal server error".to_string()
            }
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": status.as_u16()
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for AppError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        tracing::debug!(reason = %rejection.body_text(), "Rejected request body");
        if rejection.status() == axum::http::StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge("request body too large".to_string())
        } else {
            Self::bad_request("invalid JSON body")
        }
    }
}
