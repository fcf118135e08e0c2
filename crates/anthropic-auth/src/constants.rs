//! Default OAuth2 configuration.
//!
//! These are fallback values; `token_endpoint_url` and `oauth_client_id` are
//! both configurable (see the service's config loader), since the core is
//! meant to work against any upstream that speaks a standard refresh-token
//! grant, not just this default.

/// Default token endpoint used when configuration omits `token_endpoint_url`.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Default OAuth client identifier used when configuration omits `oauth_client_id`.
pub const DEFAULT_OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
