//! Error taxonomy for the request dispatcher.
//!
//! Only the dispatch-terminating cases live here. "Other 4xx" from upstream
//! is explicitly not an account failure (see `dispatch::DispatchOutcome`)
//! and is never represented as an `Error`.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no account available, retry after {retry_after_seconds}s")]
    NoAccountAvailable { retry_after_seconds: u64 },

    #[error("no such account: {0}")]
    NoSuchAccount(String),

    #[error("upstream rate limited on every account, retry after {retry_after_seconds}s")]
    UpstreamRateLimited { retry_after_seconds: u64 },

    #[error("upstream rejected credentials on every account")]
    UpstreamAuthError,

    #[error("upstream transient failure exceeded the attempt cap")]
    UpstreamTransient,

    #[error("upstream request failed: {0}")]
    Http(String),
}

impl From<anthropic_pool::Error> for Error {
    fn from(e: anthropic_pool::Error) -> Self {
        match e {
            anthropic_pool::Error::NoAccountAvailable { retry_after_seconds } => {
                Error::NoAccountAvailable { retry_after_seconds }
            }
            anthropic_pool::Error::NoSuchAccount(name) => Error::NoSuchAccount(name),
            other => Error::Http(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
