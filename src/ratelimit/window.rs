//! Fixed-window key derivation.
//!
//! Windows are lazy: a client's window opens with its first request and lasts
//! the full configured length, so the storage key only needs the client id and
//! the counter's TTL carries the window. Different clients reset at different
//! instants. Within one window at most `requests` are admitted, but a client
//! can still get up to twice that across the boundary between two windows.

use std::time::Duration;

use super::limits::ClientLimit;

/// Prefix for counter keys in every store.
pub const DEFAULT_KEY_PREFIX: &str = "rate";

/// Maps clients onto counter keys and TTLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    prefix: String,
}

impl FixedWindow {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX)
    }

    /// Namespace keys, e.g. when several services share one Redis.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Storage key for a client's counter. Format: `{prefix}:{client_id}`.
    pub fn storage_key(&self, client_id: &str) -> String {
        format!("{}:{}", self.prefix, client_id)
    }

    /// TTL to give a counter created for this limit.
    pub fn ttl(&self, limit: &ClientLimit) -> Duration {
        limit.window
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        let window = FixedWindow::new();
        assert_eq!(window.storage_key("client-1"), "rate:client-1");
        assert_eq!(window.storage_key("a:b"), "rate:a:b");
    }

    #[test]
    fn test_storage_key_is_deterministic() {
        let window = FixedWindow::with_prefix("svc");
        assert_eq!(window.storage_key("c1"), window.storage_key("c1"));
        assert_ne!(window.storage_key("c1"), window.storage_key("c2"));
    }

    #[test]
    fn test_ttl_is_full_window() {
        let limit = ClientLimit::new(5, Duration::from_secs(60));
        assert_eq!(FixedWindow::new().ttl(&limit), Duration::from_secs(60));
    }
}
