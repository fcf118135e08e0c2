//! Error types for pool operations.

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no account available, retry after {retry_after_seconds}s")]
    NoAccountAvailable { retry_after_seconds: u64 },

    #[error("no such account: {0}")]
    NoSuchAccount(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credentials error: {0}")]
    Credentials(#[from] anthropic_auth::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
