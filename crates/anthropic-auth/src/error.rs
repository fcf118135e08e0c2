//! Error types for OAuth refresh and credentials-document operations.

/// Errors from OAuth refresh and credentials-document operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenExchange(String),

    /// Refresh token rejected by the upstream (typically a 401/403, or a
    /// 400 `invalid_grant`) — the refresh token itself is no longer usable.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The on-disk credentials document is malformed or fails validation.
    #[error("credentials document invalid: {0}")]
    CredentialsInvalid(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
