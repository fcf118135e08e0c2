//! HTTP-facing error type.
//!
//! Maps the core crates' typed errors to the status codes and JSON bodies
//! the proxy returns to clients. This is the only place that knows HTTP
//! status codes in the outward-facing sense — `anthropic_pool` and
//! `dispatcher` surface typed errors, not status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    ListenerBind(String),

    #[error("no account available, retry after {retry_after_seconds}s")]
    NoAccountAvailable { retry_after_seconds: u64 },

    #[error("no such account: {0}")]
    NoSuchAccount(String),

    #[error("upstream rate limited, retry after {retry_after_seconds}s")]
    UpstreamRateLimited { retry_after_seconds: u64 },

    #[error("upstream rejected credentials on every account")]
    UpstreamAuthError,

    #[error("upstream transient failure exceeded the attempt cap")]
    UpstreamTransient,

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Result alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<dispatcher::Error> for Error {
    fn from(e: dispatcher::Error) -> Self {
        match e {
            dispatcher::Error::NoAccountAvailable { retry_after_seconds } => {
                Error::NoAccountAvailable { retry_after_seconds }
            }
            dispatcher::Error::NoSuchAccount(name) => Error::NoSuchAccount(name),
            dispatcher::Error::UpstreamRateLimited { retry_after_seconds } => {
                Error::UpstreamRateLimited { retry_after_seconds }
            }
            dispatcher::Error::UpstreamAuthError => Error::UpstreamAuthError,
            dispatcher::Error::UpstreamTransient => Error::UpstreamTransient,
            dispatcher::Error::Http(detail) => Error::Upstream(detail),
        }
    }
}

impl From<anthropic_pool::Error> for Error {
    fn from(e: anthropic_pool::Error) -> Self {
        match e {
            anthropic_pool::Error::NoAccountAvailable { retry_after_seconds } => {
                Error::NoAccountAvailable { retry_after_seconds }
            }
            anthropic_pool::Error::NoSuchAccount(name) => Error::NoSuchAccount(name),
            other => Error::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, retry_after_secs, kind) = match &self {
            Error::Config(_) | Error::ListenerBind(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None, "internal_error")
            }
            Error::NoAccountAvailable { retry_after_seconds } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(*retry_after_seconds),
                "no_account_available",
            ),
            Error::NoSuchAccount(_) => (StatusCode::BAD_REQUEST, None, "no_such_account"),
            Error::UpstreamRateLimited { retry_after_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(*retry_after_seconds),
                "upstream_rate_limited",
            ),
            Error::UpstreamAuthError => {
                (StatusCode::BAD_GATEWAY, None, "upstream_auth_error")
            }
            Error::UpstreamTransient => {
                (StatusCode::BAD_GATEWAY, None, "upstream_transient")
            }
            Error::Upstream(_) => (StatusCode::BAD_GATEWAY, None, "upstream_error"),
        };

        // Never include a token; account names are not secrets and may appear.
        let mut body = serde_json::json!({
            "error": { "kind": kind, "message": self.to_string() },
        });
        if let Some(secs) = retry_after_secs {
            body["error"]["retry_after_seconds"] = serde_json::json!(secs);
        }

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
