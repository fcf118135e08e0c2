//! Classification of upstream HTTP responses into dispatch actions.
//!
//! The dispatcher depends on nothing about the upstream API beyond this:
//! response status code, and on a 429 an optional `retry-after` header. No
//! body inspection — the upstream's wire dialect is opaque to the core.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// What the dispatcher should do about one upstream response.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// 2xx.
    Ok,
    /// 429.
    RateLimited { retry_after: Duration },
    /// 401/403.
    AuthError,
    /// 5xx.
    Transient,
    /// Any other 4xx — passed through to the client unchanged, not an
    /// account failure.
    ClientError,
}

pub fn classify(status: u16, headers: &HeaderMap) -> Classification {
    match status {
        200..=299 => Classification::Ok,
        429 => Classification::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        401 | 403 => Classification::AuthError,
        500..=599 => Classification::Transient,
        _ => Classification::ClientError,
    }
}

/// Parse a `Retry-After` header: either an integer number of seconds or an
/// HTTP-date. Falls back to `DEFAULT_RETRY_AFTER` if absent or unparsable,
/// and clamps the result to `[0, MAX_RETRY_AFTER]`.
pub fn parse_retry_after(headers: &HeaderMap) -> Duration {
    let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds).min(MAX_RETRY_AFTER);
    }

    if let Ok(when) = httpdate::parse_http_date(value.trim()) {
        if let Ok(delta) = when.duration_since(std::time::SystemTime::now()) {
            return delta.min(MAX_RETRY_AFTER);
        }
        return Duration::ZERO;
    }

    DEFAULT_RETRY_AFTER
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn success_statuses_classify_ok() {
        assert_eq!(classify(200, &HeaderMap::new()), Classification::Ok);
        assert_eq!(classify(204, &HeaderMap::new()), Classification::Ok);
    }

    #[test]
    fn rate_limit_without_header_uses_default() {
        assert_eq!(
            classify(429, &HeaderMap::new()),
            Classification::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER
            }
        );
    }

    #[test]
    fn rate_limit_with_integer_seconds_header() {
        let headers = headers_with_retry_after("30");
        assert_eq!(
            classify(429, &headers),
            Classification::RateLimited {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn rate_limit_clamps_excessive_retry_after() {
        let headers = headers_with_retry_after("999999999");
        assert_eq!(
            classify(429, &headers),
            Classification::RateLimited {
                retry_after: MAX_RETRY_AFTER
            }
        );
    }

    #[test]
    fn auth_errors_classify_as_auth_error() {
        assert_eq!(classify(401, &HeaderMap::new()), Classification::AuthError);
        assert_eq!(classify(403, &HeaderMap::new()), Classification::AuthError);
    }

    #[test]
    fn server_errors_classify_as_transient() {
        assert_eq!(classify(500, &HeaderMap::new()), Classification::Transient);
        assert_eq!(classify(503, &HeaderMap::new()), Classification::Transient);
    }

    #[test]
    fn other_4xx_classifies_as_client_error() {
        assert_eq!(classify(404, &HeaderMap::new()), Classification::ClientError);
        assert_eq!(classify(422, &HeaderMap::new()), Classification::ClientError);
    }

    #[test]
    fn malformed_retry_after_falls_back_to_default() {
        let headers = headers_with_retry_after("not-a-date-or-number");
        assert_eq!(parse_retry_after(&headers), DEFAULT_RETRY_AFTER);
    }
}
