use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Why a point mutation against the lead store did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFailure {
    /// The write did not finish within the configured write timeout.
    Timeout,
    /// The request never produced a response (connection, DNS, TLS, ...).
    Transport(String),
    /// The store answered with a non-success status.
    Rejected { status: u16, body: String },
    /// Too many consecutive write failures; writes are failing fast.
    CircuitOpen,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailure::Timeout => write!(f, "timed out"),
            WriteFailure::Transport(msg) => write!(f, "transport error: {}", msg),
            WriteFailure::Rejected { status, body } => {
                write!(f, "store returned {}: {}", status, body)
            }
            WriteFailure::CircuitOpen => write!(f, "circuit open, store writes suspended"),
        }
    }
}

impl From<reqwest::Error> for WriteFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WriteFailure::Timeout
        } else {
            WriteFailure::Transport(err.to_string())
        }
    }
}

/// Application-specific error types.
#[derive(Debug, Clone)]
pub enum AppError {
    /// The live lead feed could not be opened or was interrupted.
    SubscriptionFailed(String),
    /// A node of the upstream hierarchy matched neither known shape.
    MalformedSnapshot(String),
    /// A mutation round-trip failed.
    WriteFailed(WriteFailure),
    /// The addressed lead no longer exists (upstream or locally).
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Strips any context wrappers and returns the innermost error.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the addressed record is gone, so callers can drop a stale row quietly.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), AppError::NotFound(_))
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::SubscriptionFailed(msg) => write!(f, "Subscription failed: {}", msg),
            AppError::MalformedSnapshot(msg) => write!(f, "Malformed snapshot: {}", msg),
            AppError::WriteFailed(reason) => write!(f, "Write failed: {}", reason),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    /// Logs errors appropriately based on their severity.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::SubscriptionFailed(msg) => {
                tracing::warn!("Lead feed unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Lead feed unavailable".to_string(),
                )
            }
            AppError::MalformedSnapshot(msg) => {
                tracing::warn!("Malformed snapshot: {}", msg);
                (StatusCode::BAD_GATEWAY, "Malformed store data".to_string())
            }
            AppError::WriteFailed(reason) => {
                tracing::error!("Store write failed: {}", reason);
                let status = match reason {
                    WriteFailure::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    WriteFailure::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, format!("Write failed: {}", reason))
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                // Log full context chain for debugging
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}
