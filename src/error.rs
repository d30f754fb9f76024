//! Error handling for promptgate.
//!
//! This module defines every error the gateway can surface to a caller and
//! maps each one to an HTTP status plus the `{"detail", "error_type"}` JSON
//! envelope the API speaks. Mid-stream failures are the one exception: once
//! an SSE response has committed its 200, upstream errors become terminal
//! `error` events instead (see `pipeline`).

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::guardrail::{Rejection, ViolationKind};

/// Convenience alias for fallible gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All errors that can terminate a gateway request.
///
/// Each variant carries a stable `error_type` string for clients and metrics,
/// and maps to exactly one HTTP status code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// The client exceeded its sliding-window request budget.
    ///
    /// Raised before any policy or upstream work. Retryable after the
    /// advertised delay.
    #[error("Too many requests. Retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the oldest window entry expires.
        retry_after_secs: u64,
    },

    /// The guardrail validator rejected the message.
    ///
    /// Raised before any upstream call. Not retryable without editing the
    /// message.
    #[error("{detail}")]
    Guardrail {
        /// Which check failed.
        kind: ViolationKind,
        /// Client-visible rejection detail.
        detail: String,
        /// The blocklist keyword that matched, if any.
        matched_keyword: Option<String>,
    },

    /// The request body was malformed or failed shape validation.
    #[error("{detail}")]
    Validation {
        /// Description of the validation failure.
        detail: String,
    },

    /// Could not connect to the generation backend.
    #[error("Cannot connect to generation backend")]
    UpstreamConnectionFailed {
        /// Reason for the connection failure (logged, not sent to clients).
        reason: String,
    },

    /// The generation backend did not respond in time.
    #[error("Generation backend did not respond within {timeout_secs}s")]
    UpstreamTimeout {
        /// The configured timeout in seconds.
        timeout_secs: u64,
    },

    /// The generation backend returned an error status or an unreadable body.
    #[error("Generation backend error: {message}")]
    Upstream {
        /// HTTP status from the backend, if one was received.
        status: Option<u16>,
        /// The backend's error message (logged, not sent to clients).
        message: String,
    },

    /// Internal error that should not happen.
    #[error("Internal error: {reason}")]
    Internal {
        /// Description for operators.
        reason: String,
    },
}

impl GatewayError {
    /// Returns the stable error type name used in response bodies, logs, and
    /// metric labels.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::Guardrail { kind, .. } => kind.as_str(),
            Self::Validation { .. } => "validation_error",
            Self::UpstreamConnectionFailed { .. } => "upstream_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Maps the error to its HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Guardrail { .. } => StatusCode::BAD_REQUEST,
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UpstreamConnectionFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the retry-after hint for retryable errors.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Returns the client-visible detail string.
    ///
    /// Upstream reasons and internal messages are kept out of responses;
    /// they are logged where the error is raised.
    pub fn detail(&self) -> String {
        match self {
            Self::RateLimited { .. } => "Too many requests. Please try again later.".to_string(),
            Self::Guardrail { detail, .. } => detail.clone(),
            Self::Validation { detail } => detail.clone(),
            Self::UpstreamConnectionFailed { .. } => {
                "Failed to reach the generation backend".to_string()
            }
            Self::UpstreamTimeout { .. } => {
                "The generation backend did not respond in time".to_string()
            }
            Self::Upstream { .. } => "The generation backend returned an error".to_string(),
            Self::Internal { .. } => "Internal server error".to_string(),
        }
    }
}

impl From<Rejection> for GatewayError {
    fn from(rejection: Rejection) -> Self {
        Self::Guardrail {
            kind: rejection.kind,
            detail: rejection.detail,
            matched_keyword: rejection.matched_keyword,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "detail": self.detail(),
            "error_type": self.error_type_name(),
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
