use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
///
/// The first six variants are the execution taxonomy: what an engine call
/// (or the breaker in front of it) can end in. The rest belong to the
/// request surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Circuit breaker open for operation: {0}")]
    CircuitOpen(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`AppError`], reported in health checks and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    Connection,
    InvalidInput,
    PermissionDenied,
    UnknownEngine,
    Cancelled,
    Validation,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            AppError::Connection(_) => ErrorKind::Connection,
            AppError::InvalidInput(_) => ErrorKind::InvalidInput,
            AppError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            AppError::Engine(_) => ErrorKind::UnknownEngine,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient connection failures and unclassified engine errors are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Connection(_) | AppError::Engine(_))
    }

    /// Classify raw engine error text.
    ///
    /// Only the message is inspected; engine-specific codes are mapped by the
    /// adapters before falling back to this.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("connection") || lower.contains("timeout") || lower.contains("timed out") {
            AppError::Connection(message)
        } else if lower.contains("syntax") || lower.contains("invalid") {
            AppError::InvalidInput(message)
        } else if lower.contains("permission") || lower.contains("access denied") {
            AppError::PermissionDenied(message)
        } else {
            AppError::Engine(message)
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match self {
            AppError::CircuitOpen(operation) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorDetail::new(
                    "CIRCUIT_OPEN",
                    format!("Circuit breaker is open for {}", operation),
                )
                .with_details("Recent failures tripped the breaker. Retry after the reset timeout."),
            ),
            AppError::Connection(msg) => (
                StatusCode::BAD_GATEWAY,
                ErrorDetail::new("CONNECTION_ERROR", msg),
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("INVALID_INPUT", msg),
            ),
            AppError::PermissionDenied(msg) => (
                StatusCode::FORBIDDEN,
                ErrorDetail::new("PERMISSION_DENIED", msg),
            ),
            AppError::Engine(msg) => {
                let enhanced_msg = if msg.contains("does not exist") || msg.contains("not found") {
                    format!("{} Check that the table name and namespace are correct.", msg)
                } else {
                    msg
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetail::new("ENGINE_ERROR", enhanced_msg),
                )
            }
            AppError::Cancelled(msg) => (
                StatusCode::REQUEST_TIMEOUT,
                ErrorDetail::new("CANCELLED", msg),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", msg),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", msg),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Failures inside the service itself, such as result conversion
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_format() {
        let error = AppError::Validation("Query must not be empty".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_circuit_open_is_service_unavailable() {
        let response = AppError::CircuitOpen("execute_query".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorDetail::new("TEST_CODE", "Test message");
        assert_eq!(detail.code, "TEST_CODE");
        assert_eq!(detail.message, "Test message");
        assert!(detail.details.is_none());
    }

    #[test]
    fn test_classify_engine_messages() {
        assert_eq!(AppError::classify("Connection refused").kind(), ErrorKind::Connection);
        assert_eq!(AppError::classify("statement timeout").kind(), ErrorKind::Connection);
        assert_eq!(AppError::classify("syntax error at or near FROM").kind(), ErrorKind::InvalidInput);
        assert_eq!(AppError::classify("permission denied for table t").kind(), ErrorKind::PermissionDenied);
        assert_eq!(AppError::classify("division by zero").kind(), ErrorKind::UnknownEngine);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(AppError::Connection("reset".into()).is_retryable());
        assert!(AppError::Engine("boom".into()).is_retryable());
        assert!(!AppError::InvalidInput("bad".into()).is_retryable());
        assert!(!AppError::PermissionDenied("no".into()).is_retryable());
        assert!(!AppError::CircuitOpen("op".into()).is_retryable());
        assert!(!AppError::Cancelled("op".into()).is_retryable());
    }

    #[test]
    fn test_anyhow_errors_are_internal_and_not_retried() {
        let err: AppError = anyhow::anyhow!("Failed to downcast Int64 array")
            .context("Failed to convert results")
            .into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Failed to downcast Int64 array"));
    }
}
