//! The per-account data model and an injectable clock source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anthropic_auth::ParsedAccount;
use common::Secret;

/// Current lifecycle state of one account. See the state machine in the
/// pool module doc comment for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Available,
    RateLimited,
    AuthError,
    Disabled,
}

/// One account's tokens plus the runtime attributes the pool tracks for it.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
    pub state: AccountState,
    pub rate_limited_until: u64,
    pub last_used: Option<u64>,
    pub last_error: Option<String>,
    pub in_flight_refresh: bool,
    pub last_refresh_attempt: Option<u64>,
    pub refresh_backoff: Duration,
    /// Set when an `invalid_grant`-style terminal refresh failure moved this
    /// account to `auth_error`; suppresses further automatic refresh
    /// attempts until an admin `enable` or a reload with new tokens clears
    /// it. Distinguishes a dead refresh token from an ordinary `auth_error`
    /// reported by the dispatcher (401/403 on a request), which remains
    /// eligible for the scheduler's normal backoff retry.
    pub refresh_terminal: bool,
}

pub const INITIAL_REFRESH_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_REFRESH_BACKOFF: Duration = Duration::from_secs(300);

impl Account {
    pub fn from_parsed(parsed: ParsedAccount) -> Self {
        Self {
            name: parsed.name,
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_at,
            state: AccountState::Available,
            rate_limited_until: 0,
            last_used: None,
            last_error: None,
            in_flight_refresh: false,
            last_refresh_attempt: None,
            refresh_backoff: INITIAL_REFRESH_BACKOFF,
            refresh_terminal: false,
        }
    }

    pub fn to_parsed(&self) -> ParsedAccount {
        ParsedAccount {
            name: self.name.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Abstracts wall-clock time so pool/scheduler tests can control it instead
/// of sleeping. Production wires `SystemClock`.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }
}

/// Deterministic clock for tests: starts at an arbitrary epoch and only
/// moves forward when `advance` is called.
#[derive(Debug, Default)]
pub struct TestClock(AtomicU64);

impl TestClock {
    pub fn new(start_millis: u64) -> Self {
        Self(AtomicU64::new(start_millis))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
