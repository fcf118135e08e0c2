//! Read-only pool snapshot and admin control actions.
//!
//! These are the only account-lifecycle controls the admin surface exposes:
//! a snapshot view, and `enable`/`disable`/`force_refresh` by name. There is
//! deliberately no "add account" control here — accounts are added only by
//! editing the credentials document on disk; the watcher picks the change up.

use serde::Serialize;

use crate::account::AccountState;
use crate::error::{Error, Result};
use crate::pool::Pool;

/// One account's state as exposed to the admin view.
#[derive(Debug, Clone, Serialize)]
pub struct AccountRecord {
    pub name: String,
    pub state: AccountState,
    /// Absolute expiry of the current access token, epoch millis.
    pub expires_at: u64,
    /// Signed: negative means the access token has already expired.
    pub seconds_until_expiry: i64,
    pub rate_limited_until: Option<u64>,
    pub last_used: Option<u64>,
    pub last_error: Option<String>,
    pub in_flight_refresh: bool,
}

/// Pool-wide counts by account state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolTotals {
    pub available: usize,
    pub rate_limited: usize,
    pub auth_error: usize,
    pub disabled: usize,
}

/// A snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    pub generation: u64,
    pub totals: PoolTotals,
    /// The account name `acquire(None)` would currently return, without
    /// advancing the rotation cursor or promoting a cooled-down account.
    /// `None` if no account is currently selectable.
    pub next_account: Option<String>,
    pub accounts: Vec<AccountRecord>,
}

impl Pool {
    /// Snapshot every account's current state, in rotation order.
    pub fn view(&self) -> PoolView {
        let state = self.state.lock().unwrap();
        let now = self.now();

        let mut totals = PoolTotals::default();
        let accounts = state
            .order
            .iter()
            .filter_map(|name| state.by_name.get(name))
            .map(|account| {
                match account.state {
                    AccountState::Available => totals.available += 1,
                    AccountState::RateLimited => totals.rate_limited += 1,
                    AccountState::AuthError => totals.auth_error += 1,
                    AccountState::Disabled => totals.disabled += 1,
                }
                AccountRecord {
                    name: account.name.clone(),
                    state: account.state,
                    expires_at: account.expires_at,
                    seconds_until_expiry: (account.expires_at as i64 - now as i64) / 1000,
                    rate_limited_until: (account.rate_limited_until > 0)
                        .then_some(account.rate_limited_until),
                    last_used: account.last_used,
                    last_error: account.last_error.clone(),
                    in_flight_refresh: account.in_flight_refresh,
                }
            })
            .collect();

        let next_account = self.peek_next_account(&state, now);
        PoolView {
            generation: state.generation,
            totals,
            next_account,
            accounts,
        }
    }

    /// What `acquire(None)` would currently return, without mutating the
    /// rotation cursor or promoting a cooled-down account - a read-only peek
    /// for the admin view.
    fn peek_next_account(&self, state: &crate::pool::PoolState, now: u64) -> Option<String> {
        if state.order.is_empty() {
            return None;
        }
        let selectable = |name: &str| -> bool {
            match state.by_name.get(name) {
                Some(a) => {
                    a.state == AccountState::Available
                        || (a.state == AccountState::RateLimited && a.rate_limited_until <= now)
                }
                None => false,
            }
        };
        if !self.config.rotation_enabled {
            return selectable(&state.order[0]).then(|| state.order[0].clone());
        }
        for step in 0..state.order.len() {
            let idx = (state.cursor + step) % state.order.len();
            let name = &state.order[idx];
            if selectable(name) {
                return Some(name.clone());
            }
        }
        None
    }

    /// Move an account to `available`, clearing cooldown, error state, and
    /// the `refresh_terminal` flag that otherwise blocks automatic retry.
    pub fn enable(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let account = state
            .by_name
            .get_mut(name)
            .ok_or_else(|| Error::NoSuchAccount(name.to_string()))?;
        account.state = AccountState::Available;
        account.rate_limited_until = 0;
        account.refresh_terminal = false;
        Ok(())
    }

    /// Move an account to `disabled`. It stops being selectable by rotation
    /// and manual selection alike, and the refresh scheduler skips it.
    pub fn disable(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let account = state
            .by_name
            .get_mut(name)
            .ok_or_else(|| Error::NoSuchAccount(name.to_string()))?;
        account.state = AccountState::Disabled;
        Ok(())
    }

    /// Mark an account for an out-of-cycle refresh attempt on the scheduler's
    /// next wake, bypassing its backoff window.
    pub fn request_force_refresh(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.by_name.contains_key(name) {
            return Err(Error::NoSuchAccount(name.to_string()));
        }
        state.forced_refresh.insert(name.to_string());
        drop(state);
        self.refresh_notify.notify_one();
        Ok(())
    }
}
