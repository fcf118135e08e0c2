//! Background refresh scheduler.
//!
//! Runs on a fixed interval, woken early by the pool's `Notify` whenever an
//! account hits `auth_error` or an admin requests a force refresh. Each
//! sweep refreshes every eligible account: accounts whose access token is
//! within the proactive-refresh window of expiry, accounts in `auth_error`
//! whose backoff window has elapsed, and accounts under a pending force
//! refresh. A per-account `in_flight_refresh` flag makes concurrent sweeps
//! (interval tick racing a wake) single-flight per account.
//!
//! A refresh failure that looks like a dead refresh token (`invalid_grant`,
//! or 401/403 from the token endpoint) is terminal: the account moves to
//! `auth_error` with `refresh_terminal` set, and the scheduler will not try
//! it again until an admin `enable`s it or a reload supplies new tokens.
//! Any other failure is transient: the backoff window doubles (capped) and
//! the scheduler retries on a later sweep.

use std::sync::Arc;
use std::time::Duration;

use anthropic_auth::CredentialsStore;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::account::{AccountState, INITIAL_REFRESH_BACKOFF, MAX_REFRESH_BACKOFF};
use crate::marker::SelfWriteMarker;
use crate::pool::Pool;

#[derive(Debug, Clone)]
pub struct RefreshSchedulerConfig {
    /// How often the scheduler sweeps when not woken early (default 60s).
    pub interval: Duration,
    /// Refresh an access token proactively once it is within this long of
    /// expiring (default 5 minutes).
    pub proactive_threshold: Duration,
    pub token_endpoint: String,
    pub oauth_client_id: String,
}

impl Default for RefreshSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            proactive_threshold: Duration::from_secs(300),
            token_endpoint: anthropic_auth::DEFAULT_TOKEN_ENDPOINT.to_string(),
            oauth_client_id: anthropic_auth::DEFAULT_OAUTH_CLIENT_ID.to_string(),
        }
    }
}

/// Spawn the scheduler loop. Returns its `JoinHandle`; aborting it stops
/// all future refresh attempts (the pool keeps serving requests with
/// whatever tokens it last had).
pub fn spawn_refresh_scheduler(
    pool: Arc<Pool>,
    store: Arc<CredentialsStore>,
    marker: Arc<SelfWriteMarker>,
    client: reqwest::Client,
    config: RefreshSchedulerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = pool.wait_for_wake() => {}
            }
            sweep(&pool, &store, &marker, &client, &config).await;
        }
    })
}

async fn sweep(
    pool: &Pool,
    store: &CredentialsStore,
    marker: &SelfWriteMarker,
    client: &reqwest::Client,
    config: &RefreshSchedulerConfig,
) {
    let candidates = pool.eligible_for_refresh(config.proactive_threshold);
    if candidates.is_empty() {
        return;
    }
    debug!(count = candidates.len(), "refresh sweep starting");

    let mut any_succeeded = false;
    for name in candidates {
        if !pool.try_begin_refresh(&name) {
            continue;
        }
        let refresh_token = match pool.refresh_token_for(&name) {
            Some(token) => token,
            None => {
                pool.end_refresh(&name);
                continue;
            }
        };

        let result = anthropic_auth::refresh_token(
            client,
            &config.token_endpoint,
            &config.oauth_client_id,
            &refresh_token,
        )
        .await;

        match result {
            Ok(response) => {
                let now = pool.now_millis();
                let expires_at = now + response.expires_in * 1000;
                let new_refresh_token = response.refresh_token.unwrap_or(refresh_token);
                pool.complete_refresh_ok(&name, response.access_token, new_refresh_token, expires_at);
                info!(account = %name, "token refresh succeeded");
                any_succeeded = true;
            }
            Err(anthropic_auth::Error::InvalidCredentials(detail)) => {
                warn!(account = %name, %detail, "refresh token rejected, marking terminal");
                pool.complete_refresh_terminal(&name, detail);
            }
            Err(e) => {
                warn!(account = %name, error = %e, "refresh attempt failed, will retry with backoff");
                pool.complete_refresh_transient(&name);
            }
        }
    }

    if any_succeeded {
        let accounts = pool.all_parsed_accounts();
        match store.save(&accounts).await {
            Ok(hash) => marker.record(hash),
            Err(e) => warn!(error = %e, "failed to persist refreshed credentials"),
        }
    }
}

impl Pool {
    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Accounts eligible for a refresh attempt right now: under a pending
    /// force refresh, expiring within `proactive_threshold`, or in
    /// `auth_error` with an elapsed backoff window — excluding anything
    /// already in flight, disabled, or terminally failed.
    fn eligible_for_refresh(&self, proactive_threshold: Duration) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let now = self.now_millis();
        let threshold_millis = proactive_threshold.as_millis() as u64;

        state
            .order
            .iter()
            .filter_map(|name| {
                let account = state.by_name.get(name)?;
                if account.in_flight_refresh || account.state == AccountState::Disabled {
                    return None;
                }
                if state.forced_refresh.contains(name) {
                    return Some(name.clone());
                }
                if account.refresh_terminal {
                    return None;
                }
                let expiring_soon = account.expires_at <= now + threshold_millis;
                let auth_error_ready = account.state == AccountState::AuthError
                    && account
                        .last_refresh_attempt
                        .is_none_or(|t| now.saturating_sub(t) >= account.refresh_backoff.as_millis() as u64);
                (expiring_soon || auth_error_ready).then(|| name.clone())
            })
            .collect()
    }

    fn try_begin_refresh(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        state.forced_refresh.remove(name);
        match state.by_name.get_mut(name) {
            Some(account) if !account.in_flight_refresh => {
                account.in_flight_refresh = true;
                account.last_refresh_attempt = Some(self.now_millis());
                true
            }
            _ => false,
        }
    }

    fn end_refresh(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(account) = state.by_name.get_mut(name) {
            account.in_flight_refresh = false;
        }
    }

    fn refresh_token_for(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .by_name
            .get(name)
            .map(|a| a.refresh_token.expose().clone())
    }

    fn complete_refresh_ok(&self, name: &str, access_token: String, refresh_token: String, expires_at: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(account) = state.by_name.get_mut(name) {
            account.access_token = common::Secret::new(access_token);
            account.refresh_token = common::Secret::new(refresh_token);
            account.expires_at = expires_at;
            account.state = AccountState::Available;
            account.rate_limited_until = 0;
            account.last_error = None;
            account.in_flight_refresh = false;
            account.refresh_terminal = false;
            account.refresh_backoff = INITIAL_REFRESH_BACKOFF;
        }
    }

    fn complete_refresh_terminal(&self, name: &str, detail: String) {
        let mut state = self.state.lock().unwrap();
        if let Some(account) = state.by_name.get_mut(name) {
            account.state = AccountState::AuthError;
            account.last_error = Some(detail);
            account.in_flight_refresh = false;
            account.refresh_terminal = true;
        }
    }

    fn complete_refresh_transient(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(account) = state.by_name.get_mut(name) {
            account.in_flight_refresh = false;
            let doubled = account.refresh_backoff.saturating_mul(2).min(MAX_REFRESH_BACKOFF);
            let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
            let jittered_millis = (doubled.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
            account.refresh_backoff = Duration::from_millis(jittered_millis).min(MAX_REFRESH_BACKOFF);
        }
    }

    fn all_parsed_accounts(&self) -> Vec<anthropic_auth::ParsedAccount> {
        let state = self.state.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|name| state.by_name.get(name))
            .map(|a| a.to_parsed())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use anthropic_auth::ParsedAccount;
    use std::sync::Arc as StdArc;

    fn account_expiring(name: &str, expires_at: u64) -> ParsedAccount {
        ParsedAccount {
            name: name.into(),
            access_token: common::Secret::new(format!("at_{name}")),
            refresh_token: common::Secret::new(format!("rt_{name}")),
            expires_at,
        }
    }

    #[test]
    fn expiring_soon_account_is_eligible() {
        let clock = StdArc::new(crate::account::TestClock::new(1_000_000));
        let pool = Pool::with_clock(
            vec![account_expiring("a", 1_000_000 + 1_000)],
            PoolConfig::default(),
            clock,
        );
        let eligible = pool.eligible_for_refresh(Duration::from_secs(300));
        assert_eq!(eligible, vec!["a".to_string()]);
    }

    #[test]
    fn far_future_expiry_is_not_eligible() {
        let clock = StdArc::new(crate::account::TestClock::new(0));
        let pool = Pool::with_clock(
            vec![account_expiring("a", 9_999_999_999_999)],
            PoolConfig::default(),
            clock,
        );
        assert!(pool.eligible_for_refresh(Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn in_flight_account_is_excluded() {
        let pool = Pool::new(
            vec![account_expiring("a", 0)],
            PoolConfig::default(),
        );
        assert!(pool.try_begin_refresh("a"));
        assert!(pool.eligible_for_refresh(Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn terminal_account_is_excluded_unless_forced() {
        let pool = Pool::new(vec![account_expiring("a", 0)], PoolConfig::default());
        pool.complete_refresh_terminal("a", "dead".into());
        assert!(pool.eligible_for_refresh(Duration::from_secs(300)).is_empty());

        pool.request_force_refresh("a").unwrap();
        assert_eq!(
            pool.eligible_for_refresh(Duration::from_secs(300)),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn successful_refresh_clears_terminal_and_resets_backoff() {
        let pool = Pool::new(vec![account_expiring("a", 0)], PoolConfig::default());
        pool.complete_refresh_transient("a");
        pool.try_begin_refresh("a");
        pool.complete_refresh_ok("a", "at_new".into(), "rt_new".into(), 9_999_999_999_999);

        let view = pool.view();
        let a = &view.accounts[0];
        assert_eq!(a.state, crate::account::AccountState::Available);
    }

    /// Spawns a one-shot mock token endpoint that replies with a fixed body,
    /// mirroring `anthropic_auth::token`'s own test helper.
    async fn mock_token_endpoint(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                use std::io::{Read, Write};
                let std_stream = stream.into_std().unwrap();
                std_stream.set_nonblocking(false).unwrap();
                let mut std_stream = std_stream;
                let mut buf = [0u8; 4096];
                let _ = std_stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = std_stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn sweep_keeps_previous_refresh_token_when_response_omits_it() {
        let endpoint = mock_token_endpoint(
            r#"{"access_token":"at_new","expires_in":3600}"#,
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(vec![account_expiring("a", 0)], PoolConfig::default());
        let store = Arc::new(anthropic_auth::CredentialsStore::new(
            dir.path().join("accounts.json"),
        ));
        let marker = Arc::new(SelfWriteMarker::new());
        let client = reqwest::Client::new();
        let config = RefreshSchedulerConfig {
            token_endpoint: endpoint,
            ..RefreshSchedulerConfig::default()
        };

        sweep(&pool, &store, &marker, &client, &config).await;

        let state = pool.state.lock().unwrap();
        let a = state.by_name.get("a").unwrap();
        assert_eq!(a.access_token.expose(), "at_new");
        assert_eq!(a.refresh_token.expose(), "rt_a");
        assert_eq!(a.state, AccountState::Available);
    }

    #[test]
    fn transient_failure_backs_off_exponentially() {
        let pool = Pool::new(vec![account_expiring("a", 0)], PoolConfig::default());
        pool.try_begin_refresh("a");
        pool.complete_refresh_transient("a");
        let backoff_1 = {
            let state = pool.state.lock().unwrap();
            state.by_name.get("a").unwrap().refresh_backoff
        };
        assert!(backoff_1 > INITIAL_REFRESH_BACKOFF);

        pool.try_begin_refresh("a");
        pool.complete_refresh_transient("a");
        let backoff_2 = {
            let state = pool.state.lock().unwrap();
            state.by_name.get("a").unwrap().refresh_backoff
        };
        assert!(backoff_2 >= backoff_1);
        assert!(backoff_2 <= MAX_REFRESH_BACKOFF);
    }
}
