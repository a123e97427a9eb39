//! In-process counter store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use super::{CounterEntry, CounterStore};
use crate::error::{Error, Result, StorageError};
use crate::ratelimit::clock::{add_duration, Clock, SystemClock};

/// Default interval between sweeps of expired counters.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Tuning for [`LocalStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStoreConfig {
    /// How often the background sweep runs. Zero disables the sweeper.
    pub sweep_interval: Duration,
    /// How long past its expiry a counter is kept before it is evicted.
    pub sweep_grace: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_grace: Duration::ZERO,
        }
    }
}

/// A single live counter. The expiry never changes after creation; an
/// expired slot is replaced, not reset.
struct Slot {
    count: AtomicU64,
    expiry: DateTime<Utc>,
}

impl Slot {
    fn new(expiry: DateTime<Utc>) -> Self {
        Self {
            count: AtomicU64::new(1),
            expiry,
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }

    fn bump(&self) -> CounterEntry {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        CounterEntry::new(count, self.expiry)
    }
}

struct Shared {
    slots: RwLock<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    sweep_grace: Duration,
}

impl Shared {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| add_duration(slot.expiry, self.sweep_grace) > now);
        before - slots.len()
    }
}

struct Sweeper {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Counter store kept in process memory.
///
/// Live counters are bumped under the shared read lock with an atomic add, so
/// requests for existing keys never wait on each other. Only creating or
/// replacing a counter takes the exclusive lock. A background thread evicts
/// expired counters until the store is shut down or dropped.
pub struct LocalStore {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl LocalStore {
    /// Create a store using the system clock and start its sweeper.
    pub fn new(config: LocalStoreConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store that reads time from `clock`.
    pub fn with_clock(config: LocalStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let shared = Arc::new(Shared {
            slots: RwLock::new(HashMap::new()),
            clock,
            sweep_grace: config.sweep_grace,
        });

        let sweeper = if config.sweep_interval.is_zero() {
            None
        } else {
            Some(spawn_sweeper(Arc::clone(&shared), config.sweep_interval)?)
        };

        Ok(Self {
            shared,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Evict expired counters now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Number of counters held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.shared.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background sweeper and wait for it to exit.
    ///
    /// Idempotent. The store stays usable; expired counters are then only
    /// replaced on access.
    pub fn shutdown(&self) {
        let Some(sweeper) = self.sweeper.lock().take() else {
            return;
        };
        drop(sweeper.stop);
        if sweeper.handle.join().is_err() {
            debug!("Counter sweeper thread panicked before shutdown");
        }
        info!("Local counter store sweeper stopped");
    }

    fn increment_at(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> CounterEntry {
        {
            let slots = self.shared.slots.read();
            if let Some(slot) = slots.get(key).filter(|slot| slot.is_live(now)) {
                return slot.bump();
            }
        }

        let mut slots = self.shared.slots.write();
        // Another caller may have created or refreshed the slot while we
        // waited for the write lock.
        if let Some(slot) = slots.get(key).filter(|slot| slot.is_live(now)) {
            return slot.bump();
        }

        let expiry = add_duration(now, ttl);
        slots.insert(key.to_string(), Slot::new(expiry));
        trace!(key = %key, expiry = %expiry, "Created local counter");
        CounterEntry::new(1, expiry)
    }
}

fn spawn_sweeper(shared: Arc<Shared>, interval: Duration) -> Result<Sweeper> {
    let (stop, stopped) = mpsc::channel::<()>();

    let handle = std::thread::Builder::new()
        .name("counter-sweeper".into())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let evicted = shared.sweep();
                    trace!(evicted = evicted, "Counter sweep completed");
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(Error::Io)?;

    info!(interval = ?interval, "Local counter store sweeper started");
    Ok(Sweeper { stop, handle })
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("counters", &self.len())
            .field("clock", &self.shared.clock)
            .finish()
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn increment(
        &self,
        key: &str,
        ttl: Duration,
    ) -> std::result::Result<CounterEntry, StorageError> {
        let now = self.shared.clock.now();
        Ok(self.increment_at(key, ttl, now))
    }

    async fn get(&self, key: &str) -> std::result::Result<CounterEntry, StorageError> {
        let now = self.shared.clock.now();
        let slots = self.shared.slots.read();
        let entry = slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| CounterEntry::new(slot.count.load(Ordering::Acquire), slot.expiry))
            .unwrap_or_else(CounterEntry::absent);
        Ok(entry)
    }
}
