//! Counter storage backends.
//!
//! A [`CounterStore`] holds one counter per storage key together with the
//! instant that counter expires. Two implementations ship with the crate:
//! [`LocalStore`] keeps counters in process memory, [`RemoteStore`] keeps them
//! in a shared backend such as Redis so that several processes enforce the
//! same quota.

mod in_memory;
mod local;
mod redis_backend;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

pub use self::in_memory::InMemoryBackend;
pub use self::local::{LocalStore, LocalStoreConfig};
pub use self::redis_backend::RedisBackend;
pub use self::remote::{RemoteBackend, RemoteStore, TtlStatus};

/// Snapshot of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests counted in the live window
    pub count: u64,
    /// When the window ends; `None` for an absent counter
    pub expiry: Option<DateTime<Utc>>,
}

impl CounterEntry {
    pub fn new(count: u64, expiry: DateTime<Utc>) -> Self {
        Self {
            count,
            expiry: Some(expiry),
        }
    }

    /// The value reported for a key that does not exist or has expired.
    pub fn absent() -> Self {
        Self {
            count: 0,
            expiry: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.count == 0 && self.expiry.is_none()
    }
}

/// Storage for per-key fixed-window counters.
///
/// Implementations must be safe to call concurrently for the same key: when
/// several callers find the key absent, exactly one of them creates the
/// counter and the others increment it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request against `key`.
    ///
    /// Creates the counter with `count = 1` and `expiry = now + ttl` when the
    /// key is absent or expired, otherwise increments it and returns the
    /// existing expiry. On error the counter has not been advanced.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry, StorageError>;

    /// Read a counter without changing it.
    ///
    /// Returns [`CounterEntry::absent`] for unknown or expired keys.
    async fn get(&self, key: &str) -> Result<CounterEntry, StorageError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry, StorageError> {
        (**self).increment(key, ttl).await
    }

    async fn get(&self, key: &str) -> Result<CounterEntry, StorageError> {
        (**self).get(key).await
    }
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Box<S> {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry, StorageError> {
        (**self).increment(key, ttl).await
    }

    async fn get(&self, key: &str) -> Result<CounterEntry, StorageError> {
        (**self).get(key).await
    }
}
