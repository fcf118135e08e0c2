//! OAuth2 refresh-grant client and credentials-document codec.
//!
//! This crate has no dependency on the pool or the proxy binary — it can be
//! tested and used independently. It covers two responsibilities:
//!
//! 1. `credentials`: parse/validate/serialize the on-disk credentials
//!    document, and write it back atomically.
//! 2. `token`: perform an OAuth2 refresh-token grant against a configured
//!    token endpoint.
//!
//! Authorization-code exchange and PKCE are deliberately absent: this
//! crate assumes credentials already exist on disk and only refreshes them.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::{DEFAULT_OAUTH_CLIENT_ID, DEFAULT_TOKEN_ENDPOINT};
pub use credentials::{
    content_hash, is_valid_name, parse_document, serialize_document, CredentialsStore, ParsedAccount,
};
pub use error::{Error, Result};
pub use token::{TokenResponse, refresh_token};
