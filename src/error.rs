use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use opentelemetry::trace::TraceContextExt;
use serde_json::json;
use thiserror::Error;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::db::StoreError;
use crate::entitlement::EntitlementError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    #[error("Rate limited: retry after {wait_seconds}s")]
    RateLimited {
        wait_seconds: u64,
        remaining_daily: u32,
    },

    #[error("Upstream failed: {0}")]
    UpstreamFailed(String),

    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Entitlement(EntitlementError::DownloadNotAllowed) => StatusCode::FORBIDDEN,
            AppError::Entitlement(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::ConfigMissing(_) | AppError::Store(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Unauthorized | AppError::Jwt(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::Entitlement(e) => e.code(),
            AppError::RateLimited { .. } => "rate_limited",
            AppError::UpstreamFailed(_) => "upstream_failed",
            AppError::ConfigMissing(_) => "config_missing",
            AppError::Store(_) | AppError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::InvalidInput(msg) | AppError::NotFound(msg) => msg.clone(),
            AppError::Unauthorized => self.to_string(),
            AppError::Jwt(e) => {
                tracing::warn!(error = %e, "JWT error");
                "Invalid token".to_string()
            }
            AppError::Entitlement(e) => e.to_string(),
            AppError::RateLimited { .. } => self.to_string(),
            AppError::UpstreamFailed(msg) => {
                tracing::error!(error = %msg, "Upstream error");
                "Upstream data provider failed, please try again".to_string()
            }
            AppError::ConfigMissing(name) => {
                tracing::error!(setting = %name, "Missing configuration");
                "Server is misconfigured".to_string()
            }
            AppError::Store(e) => {
                tracing::error!(error = %e, "Store error");
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                "Internal server error".to_string()
            }
        }
    }
}

fn get_trace_id() -> Option<String> {
    let span = Span::current();
    let context = span.context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();

    if span_context.is_valid() {
        Some(span_context.trace_id().to_string())
    } else {
        None
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut body = json!({
            "error": self.public_message(),
            "code": self.code(),
            "status": status.as_u16(),
        });

        if let Some(trace_id) = get_trace_id() {
            body["trace_id"] = json!(trace_id);
        }

        let retry_after = match &self {
            AppError::RateLimited {
                wait_seconds,
                remaining_daily,
            } => {
                body["wait_seconds"] = json!(wait_seconds);
                body["remaining_daily"] = json!(remaining_daily);
                HeaderValue::from_str(&wait_seconds.to_string()).ok()
            }
            _ => None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_error() {
        let error = AppError::InvalidInput("address is too short".to_string());
        assert_eq!(error.to_string(), "Invalid input: address is too short");
    }

    #[test]
    fn test_entitlement_error_is_transparent() {
        let error = AppError::from(EntitlementError::AdjustmentAlreadyUsed);
        assert_eq!(error.to_string(), "adjustment already used");
    }

    #[test]
    fn test_error_status_and_code() {
        let cases = vec![
            (
                AppError::InvalidInput("x".to_string()),
                StatusCode::BAD_REQUEST,
                "invalid_input",
            ),
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED, "unauthorized"),
            (
                AppError::NotFound("x".to_string()),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                AppError::Entitlement(EntitlementError::AdjustmentAlreadyUsed),
                StatusCode::CONFLICT,
                "adjustment_already_used",
            ),
            (
                AppError::Entitlement(EntitlementError::NotConfirmed),
                StatusCode::CONFLICT,
                "not_confirmed",
            ),
            (
                AppError::Entitlement(EntitlementError::DownloadNotAllowed),
                StatusCode::FORBIDDEN,
                "download_not_allowed",
            ),
            (
                AppError::RateLimited {
                    wait_seconds: 4,
                    remaining_daily: 10,
                },
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
            ),
            (
                AppError::UpstreamFailed("x".to_string()),
                StatusCode::BAD_GATEWAY,
                "upstream_failed",
            ),
            (
                AppError::ConfigMissing("GOV_DATA_KEY".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_missing",
            ),
            (
                AppError::Internal("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];

        for (error, expected_status, expected_code) in cases {
            assert_eq!(error.status(), expected_status, "{error}");
            assert_eq!(error.code(), expected_code, "{error}");
        }
    }

    #[test]
    fn test_rate_limited_response_sets_retry_after() {
        let response = AppError::RateLimited {
            wait_seconds: 7,
            remaining_daily: 3,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("7")
        );
    }

    #[test]
    fn test_internal_details_are_not_echoed() {
        let error = AppError::Internal("connection string leaked".to_string());
        assert_eq!(error.public_message(), "Internal server error");
    }
}
