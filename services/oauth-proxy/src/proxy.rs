//! Thin HTTP adapter: turn an inbound axum request into a
//! `dispatcher::OutboundRequest`, run it through `dispatcher::dispatch`, and
//! turn the result back into an axum response. All account selection,
//! failover, and classification logic lives in the `dispatcher`/
//! `anthropic_pool` crates — this module only translates wire types.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response};
use axum::response::IntoResponse;
use bytes::Bytes;
use tracing::warn;

use anthropic_pool::Pool;
use dispatcher::{dispatch, DispatchOutcome, DispatcherConfig};

use crate::error::Error;
use crate::metrics::{record_request, record_upstream_error};

/// Request header carrying a manual account-selection hint. When present,
/// the dispatcher uses that account and never fails over.
const ACCOUNT_HINT_HEADER: &str = "x-account-name";

/// Cap on a buffered request body (the dispatcher retries the whole body
/// across failover attempts, so it cannot be streamed on the request side).
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub pool: Arc<Pool>,
    pub client: reqwest::Client,
    pub upstream_base: String,
    pub dispatcher_config: Arc<DispatcherConfig>,
    pub started_at: Instant,
}

/// Reports pool-derived health: a process is healthy as long as at least
/// one account is not disabled, regardless of transient rate limits.
pub async fn health_handler(State(state): State<ProxyState>) -> Response<Body> {
    let view = state.pool.view();
    let available = view
        .accounts
        .iter()
        .filter(|a| !matches!(a.state, anthropic_pool::AccountState::Disabled))
        .count();

    let body = serde_json::json!({
        "status": if available > 0 || view.accounts.is_empty() { "healthy" } else { "degraded" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts_total": view.accounts.len(),
        "accounts_available": available,
        "generation": view.generation,
    });

    (axum::http::StatusCode::OK, axum::Json(body)).into_response()
}

pub async fn proxy_handler(
    State(state): State<ProxyState>,
    request: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let method_label = request.method().as_str().to_string();

    let response = match proxy_request(&state, request).await {
        Ok(resp) => resp,
        Err(e) => {
            record_upstream_error(error_kind(&e));
            warn!(error = %e, "dispatch failed");
            e.into_response()
        }
    };

    record_request(
        response.status().as_u16(),
        &method_label,
        start.elapsed().as_secs_f64(),
    );
    response
}

fn error_kind(e: &Error) -> &'static str {
    match e {
        Error::Config(_) | Error::ListenerBind(_) => "internal",
        Error::NoAccountAvailable { .. } => "no_account_available",
        Error::NoSuchAccount(_) => "no_such_account",
        Error::UpstreamRateLimited { .. } => "rate_limited",
        Error::UpstreamAuthError => "auth_error",
        Error::UpstreamTransient => "transient",
        Error::Upstream(_) => "upstream",
    }
}

async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
) -> crate::error::Result<Response<Body>> {
    let (parts, body) = request.into_parts();

    let manual_account = parts
        .headers
        .get(ACCOUNT_HINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut headers = parts.headers.clone();
    headers.remove(ACCOUNT_HINT_HEADER);

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream_base, path_and_query);
    let url = reqwest::Url::parse(&url)
        .map_err(|e| Error::Config(format!("invalid upstream URL: {e}")))?;

    let body_bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| Error::Config(format!("failed to buffer request body: {e}")))?;

    let outbound = dispatcher::OutboundRequest {
        method: parts.method,
        url,
        headers,
        body: body_bytes,
    };

    let outcome = dispatch(
        &state.pool,
        &state.client,
        outbound,
        manual_account.as_deref(),
        &state.dispatcher_config,
    )
    .await?;

    let upstream_response = match outcome {
        DispatchOutcome::Success(r) | DispatchOutcome::Passthrough(r) => r,
    };

    Ok(convert_response(upstream_response))
}

fn convert_response(upstream: reqwest::Response) -> Response<Body> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = Body::from_stream(upstream.bytes_stream());

    let mut response = Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| {
            Response::builder()
                .status(axum::http::StatusCode::BAD_GATEWAY)
                .body(Body::from(Bytes::new()))
                .expect("static response is always valid")
        });
    *response.headers_mut() = headers;
    response
}
