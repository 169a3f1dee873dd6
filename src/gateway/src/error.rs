//! Error handling for the gateway
//!
//! One error enum covers every kind surfaced to callers, with HTTP response
//! mappings. Handlers map known failures onto these variants; anything
//! unclassified becomes `Internal` and is logged with the request id without
//! leaking internals to the caller.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Rate limit exceeded: {limit}/hour")]
    RateLimited {
        limit: u32,
        reset_time: DateTime<Utc>,
    },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Service unavailable: {service}")]
    UpstreamUnavailable { service: String },

    #[error("Upstream timeout: {message}")]
    UpstreamTimeout { message: String },

    #[error("Upstream error: {message}")]
    UpstreamError { message: String },

    #[error("Queue full: {message}")]
    QueueFull { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Standardized error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl GatewayError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn upstream_unavailable(service: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
        }
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::UpstreamTimeout {
            message: message.into(),
        }
    }

    pub fn upstream_error(message: impl Into<String>) -> Self {
        Self::UpstreamError {
            message: message.into(),
        }
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::QueueFull {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error type string for API responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Authentication { .. } => "authentication_error",
            GatewayError::PermissionDenied { .. } => "permission_error",
            GatewayError::NotFound { .. } => "not_found_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::BadRequest { .. } => "validation_error",
            GatewayError::UpstreamUnavailable { .. } => "service_unavailable_error",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout_error",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::QueueFull { .. } => "queue_full_error",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    /// Client faults are not logged server-side; everything else is.
    pub fn should_log(&self) -> bool {
        !matches!(
            self,
            GatewayError::Authentication { .. }
                | GatewayError::PermissionDenied { .. }
                | GatewayError::NotFound { .. }
                | GatewayError::RateLimited { .. }
                | GatewayError::BadRequest { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::upstream_timeout(err.to_string())
        } else if err.is_connect() {
            GatewayError::upstream_error(err.to_string())
        } else {
            GatewayError::internal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::bad_request(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_type = self.error_type();
        let message = self.to_string();

        if self.should_log() {
            error!(
                error = %self,
                status_code = %status_code,
                error_type = error_type,
                "gateway error"
            );
        }

        let reset_time = match &self {
            GatewayError::RateLimited { reset_time, .. } => Some(*reset_time),
            _ => None,
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
            reset_time,
            timestamp: Utc::now(),
        };

        let mut response = (status_code, Json(body)).into_response();
        if let Some(reset) = reset_time {
            if let Ok(value) = HeaderValue::from_str(&reset.to_rfc3339()) {
                response.headers_mut().insert("X-RateLimit-Reset", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::authentication("bad token").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::permission_denied("missing agent.execute").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::not_found("no route").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::upstream_unavailable("agent-service").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::upstream_timeout("deadline").status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::upstream_error("connection reset").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::RateLimited {
                limit: 3,
                reset_time: Utc::now(),
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_should_log_splits_client_and_server_faults() {
        assert!(!GatewayError::authentication("x").should_log());
        assert!(!GatewayError::bad_request("x").should_log());
        assert!(!GatewayError::not_found("x").should_log());
        assert!(GatewayError::internal("x").should_log());
        assert!(GatewayError::upstream_error("x").should_log());
    }

    #[test]
    fn test_rate_limited_response_carries_reset_time() {
        let reset = Utc::now();
        let response = GatewayError::RateLimited {
            limit: 3,
            reset_time: reset,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("X-RateLimit-Reset"));
    }
}
