//! Request dispatch: account selection, upstream call, and status-driven
//! classification/failover against the account pool.
//!
//! Depends only on `anthropic_pool::Pool` and `reqwest` — no HTTP-server
//! framework. The thin adapter that turns an inbound client request into an
//! `OutboundRequest` and a `DispatchOutcome` back into a client response
//! lives in the proxy service, not here.

pub mod classify;
pub mod dispatch;
pub mod error;

pub use classify::{classify, parse_retry_after, Classification};
pub use dispatch::{dispatch, DispatchOutcome, DispatcherConfig, OutboundRequest};
pub use error::{Error, Result};
