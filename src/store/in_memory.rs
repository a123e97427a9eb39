//! In-process emulation of the remote backend primitives.
//!
//! Behaves like the subset of Redis that [`RemoteStore`](super::RemoteStore)
//! uses (`INCR` with `PEXPIRE NX` in one transaction, `GET`, `PTTL`),
//! including lazy removal of expired keys. Useful for running the remote code
//! path without a server, and for injecting faults and latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::remote::{RemoteBackend, TtlStatus};
use crate::error::StorageError;
use crate::ratelimit::clock::{add_duration, Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Value {
    count: i64,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct InMemoryBackend {
    keys: Mutex<HashMap<String, Value>>,
    clock: Arc<dyn Clock>,
    failing: AtomicBool,
    latency: Mutex<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            clock,
            failing: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every command fail with a backend error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every command by `latency` before it touches any key.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Store a counter with no TTL, as if its expiry had been cleared.
    pub fn insert_without_ttl(&self, key: &str, count: i64) {
        self.keys.lock().insert(
            key.to_string(),
            Value {
                count,
                expires_at: None,
            },
        );
    }

    /// Current TTL of a key, as `PTTL` would report it.
    pub fn ttl_of(&self, key: &str) -> TtlStatus {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        live_value(&mut keys, key, now)
            .map(|value| ttl_status(value, now))
            .unwrap_or(TtlStatus::Missing)
    }

    async fn enter(&self) -> Result<(), StorageError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("connection refused".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up a key, dropping it first if it has expired.
fn live_value<'a>(
    keys: &'a mut HashMap<String, Value>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Value> {
    let expired = keys
        .get(key)
        .and_then(|value| value.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        keys.remove(key);
    }
    keys.get_mut(key)
}

fn ttl_status(value: &Value, now: DateTime<Utc>) -> TtlStatus {
    match value.expires_at {
        None => TtlStatus::NoExpiry,
        Some(at) => TtlStatus::Remaining((at - now).to_std().unwrap_or(Duration::ZERO)),
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn incr_with_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<(i64, TtlStatus), StorageError> {
        self.enter().await?;
        let now = self.clock.now();
        let mut keys = self.keys.lock();

        if live_value(&mut keys, key, now).is_none() {
            keys.insert(
                key.to_string(),
                Value {
                    count: 0,
                    expires_at: None,
                },
            );
        }
        let value = keys
            .get_mut(key)
            .ok_or_else(|| StorageError::Protocol(format!("key {} vanished", key)))?;
        value.count = value
            .count
            .checked_add(1)
            .ok_or_else(|| StorageError::Protocol(format!("counter overflow at {}", key)))?;
        if value.expires_at.is_none() {
            value.expires_at = Some(add_duration(now, ttl));
        }

        Ok((value.count, ttl_status(value, now)))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<(Option<i64>, TtlStatus), StorageError> {
        self.enter().await?;
        let now = self.clock.now();
        let mut keys = self.keys.lock();

        Ok(match live_value(&mut keys, key, now) {
            Some(value) => (Some(value.count), ttl_status(value, now)),
            None => (None, TtlStatus::Missing),
        })
    }
}
