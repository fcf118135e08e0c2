//! Credentials document file watcher.
//!
//! Watches the parent directory of the credentials document (watching the
//! directory rather than the file survives editors that replace the file
//! via rename-over-original) and reloads the pool whenever the document
//! changes on disk. Debounces rapid successive writes to a single reload,
//! and ignores its own writes via the shared self-write marker. A reload
//! that fails to parse or validate is logged and the in-memory pool is left
//! untouched — a bad edit never brings the proxy down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tracing::{debug, error, info, warn};

use anthropic_auth::{content_hash, parse_document, CredentialsStore};

use crate::marker::SelfWriteMarker;
use crate::pool::Pool;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Start watching `store`'s backing file. Returns the debouncer guard;
/// dropping it stops the watch.
pub fn spawn_watcher(
    pool: Arc<Pool>,
    store: Arc<CredentialsStore>,
    marker: Arc<SelfWriteMarker>,
) -> notify::Result<Debouncer<RecommendedWatcher, RecommendedCache>> {
    let path = store.path().to_path_buf();
    let watch_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut debouncer = new_debouncer(DEFAULT_DEBOUNCE, None, move |result: DebounceEventResult| {
        let _ = tx.send(result);
    })?;
    debouncer.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            match result {
                Ok(events) => {
                    let touched = events.iter().any(|e| e.paths.iter().any(|p| p == &path));
                    if touched {
                        reload(&pool, &store, &marker).await;
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "credentials file watch error");
                    }
                }
            }
        }
    });

    info!(path = %path.display(), "watching credentials document for changes");
    Ok(debouncer)
}

async fn reload(pool: &Pool, store: &CredentialsStore, marker: &SelfWriteMarker) {
    let contents = match tokio::fs::read_to_string(store.path()).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to read credentials document after change notification");
            return;
        }
    };

    let hash = content_hash(&contents);
    if marker.is_self_write(&hash) {
        debug!("ignoring self-write to credentials document");
        return;
    }

    match parse_document(&contents) {
        Ok(accounts) => {
            pool.apply_reload(accounts);
            info!("credentials document reloaded from external edit");
        }
        Err(e) => {
            error!(error = %e, "credentials document reload rejected, keeping previous state");
        }
    }
}
