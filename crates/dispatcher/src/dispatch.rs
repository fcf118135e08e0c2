//! The request dispatcher: account acquisition, upstream call, and
//! status-driven classification/failover.

use std::time::Duration;

use anthropic_pool::{Outcome, Pool};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

use crate::classify::{classify, Classification};
use crate::error::{Error, Result};

/// Request-scoped hop-by-hop headers that must never be forwarded upstream
/// (RFC 9110 §7.6.1), plus `authorization`, which the dispatcher always
/// replaces with the selected account's token.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "authorization",
];

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempt cap including the first try (default 3).
    pub max_attempts: u32,
    pub total_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            total_timeout: Duration::from_secs(120),
        }
    }
}

/// An upstream request, already stripped of client auth and hop-by-hop
/// headers by the HTTP-layer caller, or left as-is and stripped here —
/// either is safe since stripping is idempotent.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: reqwest::Method,
    pub url: reqwest::Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What `dispatch` produced. Both variants carry the live upstream
/// response for the HTTP layer to forward (streaming, if applicable) —
/// `Passthrough` exists only to make explicit that a non-retryable 4xx is
/// not an account failure, not to change how its body is handled.
pub enum DispatchOutcome {
    Success(reqwest::Response),
    Passthrough(reqwest::Response),
}

/// Run one dispatch: acquire an account (or use `manual_account` with no
/// failover), call upstream, classify the response, and fail over to a
/// different account up to `config.max_attempts` times.
pub async fn dispatch(
    pool: &Pool,
    client: &reqwest::Client,
    request: OutboundRequest,
    manual_account: Option<&str>,
    config: &DispatcherConfig,
) -> Result<DispatchOutcome> {
    if let Some(name) = manual_account {
        return dispatch_manual(pool, client, request, name, config).await;
    }

    let mut last_rate_limited: Option<u64> = None;
    let mut last_was_auth_error = false;
    let mut last_was_transient = false;
    let mut attempted = false;

    for attempt in 1..=config.max_attempts {
        let selected = match pool.acquire(None) {
            Ok(s) => s,
            Err(e) => {
                // Once at least one account has actually been tried, a
                // mid-loop acquire failure (every account now on cooldown,
                // disabled, etc.) means the pool is exhausted, not that
                // dispatch never got to try anything - report the last
                // observed upstream status instead of this error.
                if attempted {
                    break;
                }
                return Err(e.into());
            }
        };
        attempted = true;
        let response = send(client, &request, &selected.access_token, config).await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(account = %selected.name, error = %e, attempt, "upstream request failed");
                pool.report(&selected.name, Outcome::TransientNetworkError, false)?;
                last_was_transient = true;
                last_was_auth_error = false;
                last_rate_limited = None;
                continue;
            }
        };

        let status = response.status().as_u16();
        match classify(status, response.headers()) {
            Classification::Ok => {
                pool.report(&selected.name, Outcome::Ok, false)?;
                return Ok(DispatchOutcome::Success(response));
            }
            Classification::RateLimited { retry_after } => {
                pool.report(
                    &selected.name,
                    Outcome::RateLimited { retry_after },
                    false,
                )?;
                last_rate_limited = Some(retry_after.as_secs());
                last_was_auth_error = false;
                last_was_transient = false;
                debug!(account = %selected.name, attempt, "rate limited, failing over");
            }
            Classification::AuthError => {
                pool.report(
                    &selected.name,
                    Outcome::AuthError {
                        detail: format!("upstream returned {status}"),
                    },
                    false,
                )?;
                last_was_auth_error = true;
                last_was_transient = false;
                last_rate_limited = None;
                debug!(account = %selected.name, attempt, "auth error, failing over");
            }
            Classification::Transient => {
                pool.report(&selected.name, Outcome::TransientNetworkError, false)?;
                last_was_transient = true;
                last_was_auth_error = false;
                last_rate_limited = None;
                debug!(account = %selected.name, attempt, "transient upstream error, failing over");
            }
            Classification::ClientError => {
                // Not an account failure: return unchanged immediately.
                return Ok(DispatchOutcome::Passthrough(response));
            }
        }
    }

    if let Some(retry_after_seconds) = last_rate_limited {
        Err(Error::UpstreamRateLimited { retry_after_seconds })
    } else if last_was_auth_error {
        Err(Error::UpstreamAuthError)
    } else if last_was_transient {
        Err(Error::UpstreamTransient)
    } else {
        // The loop body always sets one of the three flags before falling
        // through, so this arm is unreachable in practice; treat it as the
        // most conservative outcome.
        Err(Error::UpstreamTransient)
    }
}

async fn dispatch_manual(
    pool: &Pool,
    client: &reqwest::Client,
    request: OutboundRequest,
    name: &str,
    config: &DispatcherConfig,
) -> Result<DispatchOutcome> {
    let selected = pool.acquire(Some(name))?;
    let response = send(client, &request, &selected.access_token, config)
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let status = response.status().as_u16();
    match classify(status, response.headers()) {
        Classification::Ok => {
            pool.report(&selected.name, Outcome::Ok, true)?;
        }
        Classification::RateLimited { retry_after } => {
            pool.report(&selected.name, Outcome::RateLimited { retry_after }, true)?;
        }
        Classification::AuthError => {
            pool.report(
                &selected.name,
                Outcome::AuthError {
                    detail: format!("upstream returned {status}"),
                },
                true,
            )?;
        }
        Classification::Transient => {
            pool.report(&selected.name, Outcome::TransientNetworkError, true)?;
        }
        Classification::ClientError => {}
    }
    // Manual mode never fails over; the upstream response goes back as-is.
    Ok(DispatchOutcome::Passthrough(response))
}

async fn send(
    client: &reqwest::Client,
    request: &OutboundRequest,
    access_token: &str,
    config: &DispatcherConfig,
) -> reqwest::Result<reqwest::Response> {
    let mut headers = request.headers.clone();
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {access_token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    client
        .request(request.method.clone(), request.url.clone())
        .headers(headers)
        .body(request.body.clone())
        .timeout(config.total_timeout)
        .send()
        .await
}
