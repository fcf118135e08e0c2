//! The account pool: authoritative in-memory registry, round-robin
//! selection with failover, and the per-account state machine.
//!
//! State machine per account:
//!
//! ```text
//! available --(upstream 429)--------------> rate_limited
//! available --(upstream 401/403)-----------> auth_error
//! available --(admin disable)--------------> disabled
//! rate_limited --(cooldown elapsed)--------> available
//! auth_error --(successful refresh)--------> available
//! auth_error --(admin disable)-------------> disabled
//! disabled --(admin enable)----------------> available
//! ```
//!
//! A single mutex guards the whole in-memory registry. It is held only for
//! plain data-structure mutation — never across an upstream call, a refresh
//! request, or a disk write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anthropic_auth::ParsedAccount;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::account::{Account, AccountState, Clock, SystemClock};
use crate::error::{Error, Result};

/// Outcome of one upstream attempt, as reported by the dispatcher.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok,
    RateLimited { retry_after: Duration },
    AuthError { detail: String },
    TransientNetworkError,
}

/// What `acquire` hands back to the dispatcher.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub name: String,
    pub access_token: String,
    pub state: AccountState,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Floor applied to a `retry_after` hint (default 60s).
    pub minimum_cooldown: Duration,
    /// If false, the pool always returns the first configured account and
    /// failover never advances past it — single-account mode.
    pub rotation_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            minimum_cooldown: Duration::from_secs(60),
            rotation_enabled: true,
        }
    }
}

pub(crate) struct PoolState {
    pub(crate) order: Vec<String>,
    pub(crate) by_name: HashMap<String, Account>,
    pub(crate) cursor: usize,
    pub(crate) generation: u64,
    pub(crate) forced_refresh: std::collections::HashSet<String>,
}

/// The account pool. Construct once at startup and share via `Arc` with
/// the dispatcher, the refresh scheduler, and the credentials watcher.
pub struct Pool {
    pub(crate) state: Mutex<PoolState>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: PoolConfig,
    pub(crate) refresh_notify: Notify,
}

impl Pool {
    pub fn new(accounts: Vec<ParsedAccount>, config: PoolConfig) -> Self {
        Self::with_clock(accounts, config, Arc::new(SystemClock))
    }

    pub fn with_clock(accounts: Vec<ParsedAccount>, config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        let mut order = Vec::with_capacity(accounts.len());
        let mut by_name = HashMap::with_capacity(accounts.len());
        for parsed in accounts {
            order.push(parsed.name.clone());
            by_name.insert(parsed.name.clone(), Account::from_parsed(parsed));
        }
        info!(accounts = order.len(), "account pool initialized");
        Self {
            state: Mutex::new(PoolState {
                order,
                by_name,
                cursor: 0,
                generation: 0,
                forced_refresh: Default::default(),
            }),
            clock,
            config,
            refresh_notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Resolves when the pool wants the refresh scheduler to re-evaluate
    /// its work list immediately (an account hit `auth_error`, a reload
    /// introduced an expired token, or an admin requested a force refresh).
    pub async fn wait_for_wake(&self) {
        self.refresh_notify.notified().await;
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Select an account to use for the next upstream request. With a
    /// `preferred` name, bypasses rotation and state filtering except for
    /// `disabled` (manual selection). Without one, scans starting at the
    /// rotation cursor, lazily promoting `rate_limited` accounts whose
    /// cooldown has elapsed, and returns the first `available` account.
    pub fn acquire(&self, preferred: Option<&str>) -> Result<SelectedAccount> {
        let mut state = self.state.lock().unwrap();

        if let Some(name) = preferred {
            let account = state
                .by_name
                .get(name)
                .ok_or_else(|| Error::NoSuchAccount(name.to_string()))?;
            if account.state == AccountState::Disabled {
                return Err(Error::NoSuchAccount(name.to_string()));
            }
            return Ok(SelectedAccount {
                name: account.name.clone(),
                access_token: account.access_token.expose().clone(),
                state: account.state,
            });
        }

        if state.order.is_empty() {
            return Err(Error::NoAccountAvailable {
                retry_after_seconds: 0,
            });
        }

        let now = self.now();

        if !self.config.rotation_enabled {
            let name = state.order[0].clone();
            let account = state.by_name.get_mut(&name).expect("order/by_name in sync");

            if account.state == AccountState::RateLimited && account.rate_limited_until <= now {
                account.state = AccountState::Available;
                account.rate_limited_until = 0;
                debug!(account = %name, "cooldown elapsed, promoted to available");
            }

            return if account.state == AccountState::Available {
                Ok(SelectedAccount {
                    name: name.clone(),
                    access_token: account.access_token.expose().clone(),
                    state: AccountState::Available,
                })
            } else {
                Err(Error::NoAccountAvailable {
                    retry_after_seconds: match account.state {
                        AccountState::RateLimited => {
                            account.rate_limited_until.saturating_sub(now) / 1000
                        }
                        _ => 0,
                    },
                })
            };
        }

        for step in 0..state.order.len() {
            let idx = (state.cursor + step) % state.order.len();
            let name = state.order[idx].clone();
            let account = state.by_name.get_mut(&name).expect("order/by_name in sync");

            if account.state == AccountState::RateLimited && account.rate_limited_until <= now {
                account.state = AccountState::Available;
                account.rate_limited_until = 0;
                debug!(account = %name, "cooldown elapsed, promoted to available");
            }

            if account.state == AccountState::Available {
                state.cursor = (idx + 1) % state.order.len();
                return Ok(SelectedAccount {
                    name: name.clone(),
                    access_token: account.access_token.expose().clone(),
                    state: AccountState::Available,
                });
            }
        }

        let soonest = state
            .by_name
            .values()
            .filter(|a| a.state == AccountState::RateLimited)
            .map(|a| a.rate_limited_until)
            .min();
        let retry_after_seconds = soonest.map(|t| t.saturating_sub(now) / 1000).unwrap_or(0);
        Err(Error::NoAccountAvailable {
            retry_after_seconds,
        })
    }

    /// Record the outcome of one upstream attempt made with `name`.
    /// `manual` suppresses the `auth_error` state transition (telemetry
    /// only, per the manual-selection semantics); all other outcomes
    /// behave identically in either mode.
    pub fn report(&self, name: &str, outcome: Outcome, manual: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = self.now();
        let account = state
            .by_name
            .get_mut(name)
            .ok_or_else(|| Error::NoSuchAccount(name.to_string()))?;

        let mut wake = false;
        match outcome {
            Outcome::Ok => {
                account.last_used = Some(now);
            }
            Outcome::RateLimited { retry_after } => {
                let floor = self.config.minimum_cooldown;
                let effective = retry_after.max(floor);
                account.state = AccountState::RateLimited;
                account.rate_limited_until = now + effective.as_millis() as u64;
                account.last_used = Some(now);
            }
            Outcome::AuthError { detail } => {
                account.last_error = Some(detail);
                account.last_used = Some(now);
                if !manual {
                    account.state = AccountState::AuthError;
                    wake = true;
                }
            }
            Outcome::TransientNetworkError => {
                metrics::counter!("pool_transient_errors_total").increment(1);
            }
        }
        drop(state);
        if wake {
            self.refresh_notify.notify_one();
        }
        Ok(())
    }

    /// Apply a freshly-loaded credentials document: accounts absent from
    /// `new_accounts` are dropped, accounts present in both keep their
    /// runtime state (rotation position, lifecycle state, counters) but
    /// have their token fields overwritten when they differ, and accounts
    /// new to the document are added as `available`. The rotation cursor
    /// is re-anchored to the account it previously pointed at, or reset to
    /// the start if that account was removed.
    pub fn apply_reload(&self, new_accounts: Vec<ParsedAccount>) {
        let mut state = self.state.lock().unwrap();
        let now = self.now();

        let previous_cursor_name = state.order.get(state.cursor).cloned();
        let new_names: std::collections::HashSet<String> =
            new_accounts.iter().map(|a| a.name.clone()).collect();

        let removed: Vec<String> = state
            .order
            .iter()
            .filter(|n| !new_names.contains(*n))
            .cloned()
            .collect();
        if !removed.is_empty() {
            debug!(?removed, "reload removed accounts");
        }
        state.order.retain(|n| new_names.contains(n));
        state.by_name.retain(|n, _| new_names.contains(n));
        state.forced_refresh.retain(|n| new_names.contains(n));

        for parsed in new_accounts {
            match state.by_name.get_mut(&parsed.name) {
                Some(existing) => {
                    if existing.access_token != parsed.access_token
                        || existing.refresh_token != parsed.refresh_token
                        || existing.expires_at != parsed.expires_at
                    {
                        existing.access_token = parsed.access_token;
                        existing.refresh_token = parsed.refresh_token;
                        existing.expires_at = parsed.expires_at;
                        existing.refresh_terminal = false;
                    }
                }
                None => {
                    state.order.push(parsed.name.clone());
                    let account = Account::from_parsed(parsed);
                    state.by_name.insert(account.name.clone(), account);
                }
            }
        }

        state.cursor = match previous_cursor_name {
            Some(name) if state.by_name.contains_key(&name) => {
                state.order.iter().position(|n| n == &name).unwrap_or(0)
            }
            _ => 0,
        };
        if !state.order.is_empty() {
            state.cursor %= state.order.len();
        } else {
            state.cursor = 0;
        }

        state.generation += 1;
        let generation = state.generation;
        let needs_refresh_wake = state.by_name.values().any(|a| a.expires_at <= now);
        drop(state);

        info!(generation, "pool reload applied");
        if needs_refresh_wake {
            self.refresh_notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;

    fn account(name: &str) -> ParsedAccount {
        ParsedAccount {
            name: name.into(),
            access_token: Secret::new(format!("at_{name}")),
            refresh_token: Secret::new(format!("rt_{name}")),
            expires_at: 9_999_999_999_999,
        }
    }

    fn pool(names: &[&str]) -> Pool {
        Pool::new(
            names.iter().map(|n| account(n)).collect(),
            PoolConfig::default(),
        )
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let p = pool(&["a", "b", "c"]);
        assert_eq!(p.acquire(None).unwrap().name, "a");
        assert_eq!(p.acquire(None).unwrap().name, "b");
        assert_eq!(p.acquire(None).unwrap().name, "c");
        assert_eq!(p.acquire(None).unwrap().name, "a");
    }

    #[test]
    fn empty_pool_returns_no_account_available() {
        let p = pool(&[]);
        assert!(matches!(
            p.acquire(None),
            Err(Error::NoAccountAvailable { .. })
        ));
    }

    #[test]
    fn single_account_always_returned() {
        let p = pool(&["only"]);
        for _ in 0..5 {
            assert_eq!(p.acquire(None).unwrap().name, "only");
        }
    }

    #[test]
    fn rate_limited_is_skipped_until_cooldown_elapses() {
        let clock = Arc::new(crate::account::TestClock::new(1_000_000));
        let p = Pool::with_clock(
            vec![account("a"), account("b")],
            PoolConfig::default(),
            clock.clone(),
        );
        p.report(
            "a",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(30),
            },
            false,
        )
        .unwrap();

        assert_eq!(p.acquire(None).unwrap().name, "b");
        assert_eq!(p.acquire(None).unwrap().name, "b");

        clock.advance(Duration::from_secs(31));
        assert_eq!(p.acquire(None).unwrap().name, "a");
    }

    #[test]
    fn rate_limit_uses_minimum_cooldown_floor() {
        let clock = Arc::new(crate::account::TestClock::new(0));
        let p = Pool::with_clock(
            vec![account("a"), account("b")],
            PoolConfig::default(),
            clock.clone(),
        );
        p.report(
            "a",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(0),
            },
            false,
        )
        .unwrap();
        clock.advance(Duration::from_secs(59));
        assert_eq!(p.acquire(None).unwrap().name, "b");
        clock.advance(Duration::from_secs(2));
        assert_eq!(p.acquire(None).unwrap().name, "a");
    }

    #[test]
    fn all_rate_limited_fails_with_soonest_retry_hint() {
        let clock = Arc::new(crate::account::TestClock::new(0));
        let p = Pool::with_clock(
            vec![account("a"), account("b")],
            PoolConfig::default(),
            clock.clone(),
        );
        p.report(
            "a",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(10),
            },
            false,
        )
        .unwrap();
        p.report(
            "b",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(20),
            },
            false,
        )
        .unwrap();

        match p.acquire(None) {
            Err(Error::NoAccountAvailable { retry_after_seconds }) => {
                assert_eq!(retry_after_seconds, 10);
            }
            other => panic!("expected NoAccountAvailable, got {other:?}"),
        }
    }

    #[test]
    fn auth_error_transitions_state_and_is_not_selectable() {
        let p = pool(&["a", "b"]);
        p.report(
            "a",
            Outcome::AuthError {
                detail: "401".into(),
            },
            false,
        )
        .unwrap();
        assert_eq!(p.acquire(None).unwrap().name, "b");
        assert_eq!(p.acquire(None).unwrap().name, "b");
    }

    #[test]
    fn manual_auth_error_does_not_mutate_state() {
        let p = pool(&["a"]);
        p.report(
            "a",
            Outcome::AuthError {
                detail: "401".into(),
            },
            true,
        )
        .unwrap();
        assert_eq!(p.acquire(None).unwrap().name, "a");
    }

    #[test]
    fn manual_selection_returns_account_regardless_of_state() {
        let p = pool(&["a"]);
        p.report(
            "a",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(30),
            },
            false,
        )
        .unwrap();
        let selected = p.acquire(Some("a")).unwrap();
        assert_eq!(selected.state, AccountState::RateLimited);
    }

    #[test]
    fn manual_selection_of_disabled_account_fails() {
        let p = pool(&["a"]);
        p.force_state_for_test("a", AccountState::Disabled);
        assert!(matches!(p.acquire(Some("a")), Err(Error::NoSuchAccount(_))));
    }

    #[test]
    fn manual_selection_of_unknown_account_fails() {
        let p = pool(&["a"]);
        assert!(matches!(p.acquire(Some("ghost")), Err(Error::NoSuchAccount(_))));
    }

    #[test]
    fn rotation_disabled_always_returns_first_entry() {
        let clock = Arc::new(crate::account::TestClock::new(0));
        let p = Pool::with_clock(
            vec![account("a"), account("b")],
            PoolConfig {
                rotation_enabled: false,
                ..PoolConfig::default()
            },
            clock.clone(),
        );
        assert_eq!(p.acquire(None).unwrap().name, "a");
        assert_eq!(p.acquire(None).unwrap().name, "a");

        p.report(
            "a",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(30),
            },
            false,
        )
        .unwrap();
        // "b" is never selected even though it is available - no failover.
        assert!(matches!(
            p.acquire(None),
            Err(Error::NoAccountAvailable { .. })
        ));

        clock.advance(Duration::from_secs(31));
        assert_eq!(p.acquire(None).unwrap().name, "a");
    }

    #[test]
    fn transient_error_does_not_change_state() {
        let p = pool(&["a", "b"]);
        p.report("a", Outcome::TransientNetworkError, false).unwrap();
        assert_eq!(p.acquire(None).unwrap().name, "a");
    }

    #[test]
    fn reload_adds_new_accounts_as_available() {
        let p = pool(&["a"]);
        p.apply_reload(vec![account("a"), account("b")]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.generation(), 1);
    }

    #[test]
    fn reload_removes_absent_accounts() {
        let p = pool(&["a", "b"]);
        p.apply_reload(vec![account("b")]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.acquire(None).unwrap().name, "b");
    }

    #[test]
    fn reload_preserves_runtime_state_but_overwrites_tokens() {
        let clock = Arc::new(crate::account::TestClock::new(1_000_000));
        let p = Pool::with_clock(
            vec![account("a"), account("b")],
            PoolConfig::default(),
            clock,
        );
        p.report(
            "a",
            Outcome::RateLimited {
                retry_after: Duration::from_secs(60),
            },
            false,
        )
        .unwrap();

        let mut fresh_a = account("a");
        fresh_a.access_token = Secret::new("at_a_new".to_string());
        p.apply_reload(vec![fresh_a, account("b"), account("c")]);

        let state = p.state.lock().unwrap();
        let a = state.by_name.get("a").unwrap();
        assert_eq!(a.state, AccountState::RateLimited);
        assert_eq!(a.access_token.expose(), "at_a_new");
        let c = state.by_name.get("c").unwrap();
        assert_eq!(c.state, AccountState::Available);
    }

    #[test]
    fn reload_resets_cursor_if_target_removed() {
        let p = pool(&["a", "b", "c"]);
        p.acquire(None).unwrap();
        p.apply_reload(vec![account("a"), account("c")]);
        let state = p.state.lock().unwrap();
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn repeated_reload_with_same_set_is_idempotent() {
        let p = pool(&["a", "b"]);
        p.apply_reload(vec![account("a"), account("b")]);
        let gen_after_first = p.generation();
        p.apply_reload(vec![account("a"), account("b")]);
        assert_eq!(p.generation(), gen_after_first + 1);
        assert_eq!(p.len(), 2);
    }

    impl Pool {
        fn force_state_for_test(&self, name: &str, state: AccountState) {
            let mut guard = self.state.lock().unwrap();
            if let Some(account) = guard.by_name.get_mut(name) {
                account.state = state;
            }
        }
    }
}
