//! Configuration loading: a TOML file merged with environment-variable
//! overrides, `env > file > built-in default`.
//!
//! The file is parsed into an all-`Option` intermediate (`RawConfig`) so a
//! config file can omit anything; environment variables are applied on top
//! of whatever the file provided, and finally defaults fill whatever is
//! still missing.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Fully-resolved configuration used by the running service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the credentials document (`accounts_path`).
    pub accounts_path: PathBuf,
    /// If false, the pool operates in single-account mode; failover is
    /// disabled.
    pub rotation_enabled: bool,
    /// Enables the credentials-document file watcher.
    pub hot_reload: bool,
    /// How long before expiry the scheduler proactively refreshes a token.
    pub refresh_buffer_seconds: u64,
    /// Floor applied to a `retry-after` cooldown.
    pub minimum_cooldown_seconds: u64,
    /// Dispatch failover attempt cap.
    pub max_attempts: u32,
    /// Per-attempt total deadline for an upstream call.
    pub upstream_total_timeout_secs: u64,
    /// Idle-read timeout on a streaming upstream response.
    pub upstream_idle_timeout_secs: u64,
    /// OAuth2 token endpoint used by the refresh scheduler.
    pub token_endpoint_url: String,
    /// Client identifier presented in the refresh grant.
    pub oauth_client_id: String,
    /// Address the proxy's public listener binds to.
    pub listen_addr: SocketAddr,
    /// Address the admin/control listener binds to.
    pub admin_listen_addr: SocketAddr,
}

impl Config {
    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_seconds)
    }

    pub fn minimum_cooldown(&self) -> Duration {
        Duration::from_secs(self.minimum_cooldown_seconds)
    }

    pub fn upstream_total_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_total_timeout_secs)
    }

    pub fn upstream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_idle_timeout_secs)
    }

    /// `--config <path>` wins; otherwise `OAUTH_PROXY_CONFIG`; otherwise the
    /// workspace-conventional default.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("OAUTH_PROXY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("config.toml")
    }

    /// Load from `path` (missing file is not an error — defaults apply),
    /// then layer environment-variable overrides on top.
    pub fn load(path: &Path) -> common::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawConfig::default(),
            Err(e) => return Err(e.into()),
        };
        Self::from_raw(raw).and_then(Self::apply_env_overrides)
    }

    fn from_raw(raw: RawConfig) -> common::Result<Self> {
        Ok(Self {
            accounts_path: raw
                .accounts_path
                .unwrap_or_else(default_accounts_path),
            rotation_enabled: raw.rotation_enabled.unwrap_or(true),
            hot_reload: raw.hot_reload.unwrap_or(true),
            refresh_buffer_seconds: raw.refresh_buffer_seconds.unwrap_or(600),
            minimum_cooldown_seconds: raw.minimum_cooldown_seconds.unwrap_or(60),
            max_attempts: raw.max_attempts.unwrap_or(3),
            upstream_total_timeout_secs: raw.upstream_total_timeout_secs.unwrap_or(120),
            upstream_idle_timeout_secs: raw.upstream_idle_timeout_secs.unwrap_or(30),
            token_endpoint_url: raw
                .token_endpoint_url
                .unwrap_or_else(|| anthropic_auth::DEFAULT_TOKEN_ENDPOINT.to_string()),
            oauth_client_id: raw
                .oauth_client_id
                .unwrap_or_else(|| anthropic_auth::DEFAULT_OAUTH_CLIENT_ID.to_string()),
            listen_addr: raw
                .listen_addr
                .unwrap_or_else(|| "0.0.0.0:8080".parse().unwrap()),
            admin_listen_addr: raw
                .admin_listen_addr
                .unwrap_or_else(|| "127.0.0.1:9090".parse().unwrap()),
        })
    }

    fn apply_env_overrides(mut self) -> common::Result<Self> {
        if let Ok(v) = std::env::var("ACCOUNTS_PATH") {
            self.accounts_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROTATION_ENABLED") {
            self.rotation_enabled = parse_bool(&v)?;
        }
        if let Ok(v) = std::env::var("HOT_RELOAD") {
            self.hot_reload = parse_bool(&v)?;
        }
        if let Ok(v) = std::env::var("REFRESH_BUFFER_SECONDS") {
            self.refresh_buffer_seconds = parse_u64(&v)?;
        }
        if let Ok(v) = std::env::var("MINIMUM_COOLDOWN_SECONDS") {
            self.minimum_cooldown_seconds = parse_u64(&v)?;
        }
        if let Ok(v) = std::env::var("MAX_ATTEMPTS") {
            self.max_attempts = parse_u64(&v)? as u32;
        }
        if let Ok(v) = std::env::var("UPSTREAM_TOTAL_TIMEOUT_SECS") {
            self.upstream_total_timeout_secs = parse_u64(&v)?;
        }
        if let Ok(v) = std::env::var("UPSTREAM_IDLE_TIMEOUT_SECS") {
            self.upstream_idle_timeout_secs = parse_u64(&v)?;
        }
        if let Ok(v) = std::env::var("TOKEN_ENDPOINT_URL") {
            self.token_endpoint_url = v;
        }
        if let Ok(v) = std::env::var("OAUTH_CLIENT_ID") {
            self.oauth_client_id = v;
        }
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            self.listen_addr = v
                .parse()
                .map_err(|_| common::Error::Config(format!("invalid LISTEN_ADDR: {v}")))?;
        }
        if let Ok(v) = std::env::var("ADMIN_LISTEN_ADDR") {
            self.admin_listen_addr = v
                .parse()
                .map_err(|_| common::Error::Config(format!("invalid ADMIN_LISTEN_ADDR: {v}")))?;
        }
        Ok(self)
    }
}

fn parse_bool(v: &str) -> common::Result<bool> {
    match v {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(common::Error::Config(format!(
            "invalid boolean override {other:?}"
        ))),
    }
}

fn parse_u64(v: &str) -> common::Result<u64> {
    v.parse()
        .map_err(|_| common::Error::Config(format!("invalid integer override {v:?}")))
}

fn default_accounts_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".claude").join("accounts.json")
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    accounts_path: Option<PathBuf>,
    rotation_enabled: Option<bool>,
    hot_reload: Option<bool>,
    refresh_buffer_seconds: Option<u64>,
    minimum_cooldown_seconds: Option<u64>,
    max_attempts: Option<u32>,
    upstream_total_timeout_secs: Option<u64>,
    upstream_idle_timeout_secs: Option<u64>,
    token_endpoint_url: Option<String>,
    oauth_client_id: Option<String>,
    listen_addr: Option<SocketAddr>,
    admin_listen_addr: Option<SocketAddr>,
}
