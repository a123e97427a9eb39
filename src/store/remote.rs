//! Counter store backed by a shared key/value service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{CounterEntry, CounterStore};
use crate::error::StorageError;
use crate::ratelimit::clock::{add_duration, Clock, SystemClock};

/// Default bound on a single backend round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// What a backend reports about a key's time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// The key does not exist.
    Missing,
    /// The key exists but will never expire.
    NoExpiry,
    /// The key expires after this long.
    Remaining(Duration),
}

impl TtlStatus {
    /// Interpret a Redis `PTTL` reply: `-2` missing, `-1` no expiry.
    pub fn from_pttl(pttl: i64) -> Self {
        match pttl {
            -1 => TtlStatus::NoExpiry,
            ms if ms >= 0 => TtlStatus::Remaining(Duration::from_millis(ms as u64)),
            _ => TtlStatus::Missing,
        }
    }
}

/// Primitives a shared backend must offer for [`RemoteStore`].
///
/// Each method is one round trip.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Increment `key` (creating it at 1), give it a TTL of `ttl` if it has
    /// none, and read the TTL back. The three steps apply as one unit: either
    /// all of them take effect or none do.
    async fn incr_with_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<(i64, TtlStatus), StorageError>;

    /// Read the counter stored at `key` and its TTL.
    async fn get_with_ttl(&self, key: &str) -> Result<(Option<i64>, TtlStatus), StorageError>;
}

#[async_trait]
impl<B: RemoteBackend + ?Sized> RemoteBackend for Arc<B> {
    async fn incr_with_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<(i64, TtlStatus), StorageError> {
        (**self).incr_with_ttl(key, ttl).await
    }

    async fn get_with_ttl(&self, key: &str) -> Result<(Option<i64>, TtlStatus), StorageError> {
        (**self).get_with_ttl(key).await
    }
}

/// Counter store that pushes all mutual exclusion into a shared backend.
///
/// The increment that creates a key also sets its TTL to the window, in the
/// same transaction. Later increments leave the TTL alone, so every caller in
/// a window sees the same expiry.
pub struct RemoteStore<B> {
    backend: B,
    clock: Arc<dyn Clock>,
    command_timeout: Duration,
}

impl<B: RemoteBackend> RemoteStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Bound every backend round trip by `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Read time from `clock` when turning TTLs into expiry instants.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| StorageError::Timeout {
                after: Some(self.command_timeout),
            })?
    }
}

fn to_count(key: &str, raw: i64) -> Result<u64, StorageError> {
    u64::try_from(raw)
        .map_err(|_| StorageError::Protocol(format!("negative counter {} at {}", raw, key)))
}

#[async_trait]
impl<B: RemoteBackend> CounterStore for RemoteStore<B> {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry, StorageError> {
        let now = self.clock.now();
        let (raw, ttl_status) = self.bounded(self.backend.incr_with_ttl(key, ttl)).await?;
        let count = to_count(key, raw)?;

        match ttl_status {
            TtlStatus::Remaining(left) => {
                if count == 1 {
                    debug!(key = %key, ttl = ?ttl, "Opened remote counter window");
                }
                Ok(CounterEntry::new(count, add_duration(now, left)))
            }
            TtlStatus::Missing | TtlStatus::NoExpiry => Err(StorageError::Protocol(format!(
                "counter at {} has no expiry after increment",
                key
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<CounterEntry, StorageError> {
        let now = self.clock.now();
        let (raw, ttl_status) = self.bounded(self.backend.get_with_ttl(key)).await?;

        let entry = match (raw, ttl_status) {
            (Some(raw), TtlStatus::Remaining(left)) if !left.is_zero() => {
                CounterEntry::new(to_count(key, raw)?, add_duration(now, left))
            }
            _ => CounterEntry::absent(),
        };
        trace!(key = %key, count = entry.count, "Read remote counter");
        Ok(entry)
    }
}

impl<B> std::fmt::Debug for RemoteStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("command_timeout", &self.command_timeout)
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::store::InMemoryBackend;

    const WINDOW: Duration = Duration::from_secs(60);

    fn remote_store() -> (RemoteStore<Arc<InMemoryBackend>>, Arc<InMemoryBackend>, ManualClock) {
        let clock = ManualClock::default();
        let backend = Arc::new(InMemoryBackend::with_clock(Arc::new(clock.clone())));
        let store = RemoteStore::new(Arc::clone(&backend)).with_clock(Arc::new(clock.clone()));
        (store, backend, clock)
    }

    #[test]
    fn test_ttl_status_from_pttl() {
        assert_eq!(TtlStatus::from_pttl(-2), TtlStatus::Missing);
        assert_eq!(TtlStatus::from_pttl(-1), TtlStatus::NoExpiry);
        assert_eq!(
            TtlStatus::from_pttl(1500),
            TtlStatus::Remaining(Duration::from_millis(1500))
        );
    }

    #[tokio::test]
    async fn test_first_increment_sets_window_ttl() {
        let (store, backend, clock) = remote_store();

        let entry = store.increment("rate:c1", WINDOW).await.unwrap();

        assert_eq!(entry.count, 1);
        assert_eq!(entry.expiry, Some(add_duration(clock.now(), WINDOW)));
        assert_eq!(backend.ttl_of("rate:c1"), TtlStatus::Remaining(WINDOW));
    }

    #[tokio::test]
    async fn test_later_increments_keep_expiry() {
        let (store, _backend, clock) = remote_store();

        let first = store.increment("rate:c1", WINDOW).await.unwrap();
        clock.advance(Duration::from_secs(15));
        let second = store.increment("rate:c1", WINDOW).await.unwrap();

        assert_eq!(second.count, 2);
        assert_eq!(second.expiry, first.expiry);
    }

    #[tokio::test]
    async fn test_cleared_ttl_is_restored() {
        let (store, backend, clock) = remote_store();
        backend.insert_without_ttl("rate:c1", 4);

        let entry = store.increment("rate:c1", WINDOW).await.unwrap();

        assert_eq!(entry.count, 5);
        assert_eq!(entry.expiry, Some(add_duration(clock.now(), WINDOW)));
        assert_eq!(backend.ttl_of("rate:c1"), TtlStatus::Remaining(WINDOW));
    }

    #[tokio::test]
    async fn test_failed_increment_leaves_no_key() {
        let (store, backend, _clock) = remote_store();

        backend.set_failing(true);
        assert!(store.increment("rate:c1", WINDOW).await.is_err());

        backend.set_failing(false);
        assert_eq!(backend.ttl_of("rate:c1"), TtlStatus::Missing);
        let entry = store.increment("rate:c1", WINDOW).await.unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(backend.ttl_of("rate:c1"), TtlStatus::Remaining(WINDOW));
    }

    #[tokio::test]
    async fn test_expired_key_starts_over() {
        let (store, _backend, clock) = remote_store();

        store.increment("rate:c1", WINDOW).await.unwrap();
        store.increment("rate:c1", WINDOW).await.unwrap();
        clock.advance(WINDOW);

        let entry = store.increment("rate:c1", WINDOW).await.unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.expiry, Some(add_duration(clock.now(), WINDOW)));
    }

    #[tokio::test]
    async fn test_get_unknown_and_expired_keys_are_absent() {
        let (store, _backend, clock) = remote_store();
        assert_eq!(store.get("rate:never").await.unwrap(), CounterEntry::absent());

        store.increment("rate:c1", WINDOW).await.unwrap();
        let live = store.get("rate:c1").await.unwrap();
        assert_eq!(live.count, 1);

        clock.advance(WINDOW + Duration::from_secs(1));
        assert!(store.get("rate:c1").await.unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_get_without_ttl_is_absent() {
        let (store, backend, _clock) = remote_store();
        backend.insert_without_ttl("rate:c1", 3);
        assert!(store.get("rate:c1").await.unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_backend_failure_does_not_advance_counter() {
        let (store, backend, _clock) = remote_store();
        store.increment("rate:c1", WINDOW).await.unwrap();

        backend.set_failing(true);
        let err = store.increment("rate:c1", WINDOW).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(store.get("rate:c1").await.is_err());

        backend.set_failing(false);
        assert_eq!(store.get("rate:c1").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let (store, backend, _clock) = remote_store();
        let store = store.with_command_timeout(Duration::from_millis(20));
        backend.set_latency(Duration::from_millis(200));

        let err = store.increment("rate:c1", WINDOW).await.unwrap_err();
        assert_eq!(
            err,
            StorageError::Timeout {
                after: Some(Duration::from_millis(20)),
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_increments() {
        let (store, backend, _clock) = remote_store();
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.increment("rate:hot", WINDOW).await.unwrap() })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().count)
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=32).collect::<Vec<u64>>());
        assert_eq!(backend.ttl_of("rate:hot"), TtlStatus::Remaining(WINDOW));
    }
}
