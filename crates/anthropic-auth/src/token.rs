//! OAuth2 refresh-token grant.
//!
//! Acquisition (authorization code exchange, PKCE) is out of scope: this
//! module only implements the refresh leg, which is what the background
//! scheduler and request-time recovery both need.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the token endpoint's refresh grant.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when updating
/// the account.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Omitted by the upstream on a non-rotating refresh; the caller keeps
    /// the previous refresh token in that case.
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute).
    pub expires_in: u64,
}

/// Refresh an access token using a refresh token.
///
/// `endpoint` and `client_id` are configuration, not constants, so the core
/// can refresh against any upstream speaking a standard OAuth2 refresh grant.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403, or a 400 carrying `invalid_grant`, means the refresh
        // token itself is dead — no amount of retrying will help.
        if status.as_u16() == 401 || status.as_u16() == 403 || body.contains("invalid_grant") {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tokio::net::TcpListener;

    #[test]
    fn token_response_deserializes() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token, Some("rt_def".to_string()));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn token_response_deserializes_without_rotated_refresh_token() {
        let json = r#"{"access_token":"at_abc","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token, None);
    }

    /// Spawns a one-shot mock token endpoint that replies with a fixed
    /// status/body, and returns its `http://127.0.0.1:<port>` base URL.
    async fn mock_token_endpoint(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let std_stream = stream.into_std().unwrap();
                std_stream.set_nonblocking(false).unwrap();
                let mut std_stream = std_stream;
                let mut buf = [0u8; 4096];
                let _ = std_stream.read(&mut buf);
                let response = format!(
                    "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = std_stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn refresh_success_parses_response() {
        let endpoint = mock_token_endpoint(
            "HTTP/1.1 200 OK",
            r#"{"access_token":"at_new","refresh_token":"rt_new","expires_in":3600}"#,
        )
        .await;
        let client = reqwest::Client::new();
        let token = refresh_token(&client, &endpoint, "client-1", "rt_old")
            .await
            .unwrap();
        assert_eq!(token.access_token, "at_new");
        assert_eq!(token.expires_in, 3600);
    }

    #[tokio::test]
    async fn refresh_rejects_invalid_grant() {
        let endpoint = mock_token_endpoint(
            "HTTP/1.1 400 Bad Request",
            r#"{"error":"invalid_grant"}"#,
        )
        .await;
        let client = reqwest::Client::new();
        let result = refresh_token(&client, &endpoint, "client-1", "rt_dead").await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn refresh_rejects_401() {
        let endpoint =
            mock_token_endpoint("HTTP/1.1 401 Unauthorized", r#"{"error":"unauthorized"}"#).await;
        let client = reqwest::Client::new();
        let result = refresh_token(&client, &endpoint, "client-1", "rt_dead").await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn refresh_other_error_is_token_exchange() {
        let endpoint =
            mock_token_endpoint("HTTP/1.1 500 Internal Server Error", "oops").await;
        let client = reqwest::Client::new();
        let result = refresh_token(&client, &endpoint, "client-1", "rt_old").await;
        assert!(matches!(result, Err(Error::TokenExchange(_))));
    }
}
