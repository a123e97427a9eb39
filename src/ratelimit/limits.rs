//! Per-client limit configuration.
//!
//! Limits are held in a [`LimitTable`] snapshot. A [`LimitRegistry`] owns the
//! current snapshot and lets configuration updates swap it atomically while
//! admission checks keep reading the snapshot they already loaded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Default number of requests per window when nothing is configured.
pub const DEFAULT_REQUESTS: u64 = 100;
/// Default window length when nothing is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Quota for one client: `requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLimit {
    /// Maximum requests admitted in one window
    pub requests: u64,
    /// Length of the window
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
}

impl ClientLimit {
    pub fn new(requests: u64, window: Duration) -> Self {
        Self { requests, window }
    }

    /// Check that both the request count and the window are positive.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.requests == 0 {
            return Err("requests must be greater than zero".to_string());
        }
        if self.window.is_zero() {
            return Err("window must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl Default for ClientLimit {
    fn default() -> Self {
        Self {
            requests: DEFAULT_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(window: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(window.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// An immutable snapshot of the client limit configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitTable {
    /// Limit applied to clients without an explicit entry
    #[serde(default)]
    pub default: ClientLimit,
    /// Explicit per-client limits
    #[serde(default)]
    pub clients: HashMap<String, ClientLimit>,
}

impl LimitTable {
    /// Create a table with only a default limit.
    pub fn new(default: ClientLimit) -> Self {
        Self {
            default,
            clients: HashMap::new(),
        }
    }

    /// Builder-style helper to add a client entry.
    pub fn with_client(mut self, client_id: impl Into<String>, limit: ClientLimit) -> Self {
        self.clients.insert(client_id.into(), limit);
        self
    }

    /// Parse a limit table from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: LimitTable = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse limit table: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    /// Reject tables with any non-positive limit.
    pub fn validate(&self) -> Result<()> {
        self.default
            .validate()
            .map_err(|reason| Error::Config(format!("default limit: {}", reason)))?;
        for (client_id, limit) in &self.clients {
            limit
                .validate()
                .map_err(|reason| Error::Config(format!("limit for {}: {}", client_id, reason)))?;
        }
        Ok(())
    }

    /// The effective limit for a client: its own entry, else the default.
    pub fn resolve(&self, client_id: &str) -> ClientLimit {
        self.clients.get(client_id).copied().unwrap_or(self.default)
    }
}

/// Thread-safe owner of the current [`LimitTable`].
#[derive(Debug)]
pub struct LimitRegistry {
    table: ArcSwap<LimitTable>,
}

impl LimitRegistry {
    pub fn new(table: LimitTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// The table as of now. Later updates do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<LimitTable> {
        self.table.load_full()
    }

    /// Resolve the effective limit for a client against the current table.
    pub fn resolve(&self, client_id: &str) -> ClientLimit {
        self.table.load().resolve(client_id)
    }

    /// Swap in a whole new table.
    pub fn replace(&self, table: LimitTable) {
        info!(clients = table.clients.len(), "Client limit table replaced");
        self.table.store(Arc::new(table));
    }

    /// Set or overwrite a single client's limit.
    pub fn set_limit(&self, client_id: &str, limit: ClientLimit) {
        self.table.rcu(|current| {
            let mut next = LimitTable::clone(current);
            next.clients.insert(client_id.to_string(), limit);
            next
        });
    }

    /// Drop a client's explicit limit so it falls back to the default.
    pub fn remove_limit(&self, client_id: &str) {
        self.table.rcu(|current| {
            let mut next = LimitTable::clone(current);
            next.clients.remove(client_id);
            next
        });
    }
}

impl Default for LimitRegistry {
    fn default() -> Self {
        Self::new(LimitTable::default())
    }
}
