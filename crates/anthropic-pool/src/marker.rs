//! Shared self-write suppression marker.
//!
//! The refresh scheduler writes the credentials document back to disk after
//! a successful refresh. Without this marker the file watcher would then
//! see its own write as an external edit and reload immediately — harmless,
//! but a wasted parse/diff cycle on every refresh. The scheduler records the
//! content hash it just wrote; the watcher checks incoming hashes against it
//! and skips a reload that matches.

use std::sync::Mutex;

#[derive(Default)]
pub struct SelfWriteMarker(Mutex<Option<String>>);

impl SelfWriteMarker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hash of content this process just wrote to disk.
    pub fn record(&self, hash: String) {
        *self.0.lock().unwrap() = Some(hash);
    }

    /// Check whether `hash` matches the last recorded self-write, clearing
    /// it either way — each recorded write is consumed by at most one check.
    pub fn is_self_write(&self, hash: &str) -> bool {
        let mut guard = self.0.lock().unwrap();
        if guard.as_deref() == Some(hash) {
            *guard = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_hash_is_consumed_once() {
        let marker = SelfWriteMarker::new();
        marker.record("abc".into());
        assert!(marker.is_self_write("abc"));
        assert!(!marker.is_self_write("abc"));
    }

    #[test]
    fn non_matching_hash_is_not_self_write() {
        let marker = SelfWriteMarker::new();
        marker.record("abc".into());
        assert!(!marker.is_self_write("xyz"));
    }

    #[test]
    fn no_recorded_write_is_never_self_write() {
        let marker = SelfWriteMarker::new();
        assert!(!marker.is_self_write("anything"));
    }
}
