//! Account pool for OAuth-backed upstream accounts.
//!
//! Owns the authoritative in-memory registry of accounts (`pool`), their
//! data model (`account`), the admin-facing read/control surface
//! (`status`), the background refresh scheduler (`refresh`), and the
//! credentials-document file watcher (`watcher`). Classification of
//! upstream responses into pool-relevant outcomes lives in the dispatcher
//! crate, not here — this crate only knows how to react to an `Outcome`
//! once classified, not how to produce one from an HTTP response.
//!
//! Account lifecycle:
//! 1. Startup loads the credentials document and constructs the pool —
//!    every account starts `available`.
//! 2. The dispatcher calls `acquire` to get a token, then `report` with
//!    the outcome of the request it made.
//! 3. `rate_limited` accounts become selectable again automatically once
//!    their cooldown elapses; `auth_error` accounts are retried by the
//!    refresh scheduler on a backoff, or moved to `disabled` by an admin.
//! 4. The file watcher reconciles the in-memory pool whenever the
//!    credentials document changes on disk, including from the scheduler's
//!    own writes after a successful refresh.

pub mod account;
pub mod error;
pub mod marker;
pub mod pool;
pub mod refresh;
pub mod status;
pub mod watcher;

pub use account::{Account, AccountState, Clock, SystemClock, TestClock};
pub use error::{Error, Result};
pub use marker::SelfWriteMarker;
pub use pool::{Outcome, Pool, PoolConfig, SelectedAccount};
pub use refresh::{spawn_refresh_scheduler, RefreshSchedulerConfig};
pub use status::{AccountRecord, PoolView};
pub use watcher::spawn_watcher;
