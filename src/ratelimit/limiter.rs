//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::limits::{ClientLimit, LimitRegistry};
use super::window::FixedWindow;
use crate::error::{LimiterError, StorageError};
use crate::store::CounterStore;

/// What to answer when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request. A broken limiter does not take the service down.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

impl FailurePolicy {
    fn fallback(self, limit: u64) -> Decision {
        match self {
            FailurePolicy::Open => Decision::fail_open(limit),
            FailurePolicy::Closed => Decision::fail_closed(limit),
        }
    }
}

/// Fixed-window admission engine.
///
/// Stateless apart from its handles to the limit registry and the counter
/// store, so one instance can serve any number of concurrent callers.
pub struct RateLimiter {
    /// Counter state, local or shared
    store: Arc<dyn CounterStore>,
    /// Per-client limits, swappable at runtime
    limits: Arc<LimitRegistry>,
    window: FixedWindow,
    failure_policy: FailurePolicy,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter over `store` using the limits in `limits`.
    pub fn new(store: Arc<dyn CounterStore>, limits: Arc<LimitRegistry>) -> Self {
        Self {
            store,
            limits,
            window: FixedWindow::new(),
            failure_policy: FailurePolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_window(mut self, window: FixedWindow) -> Self {
        self.window = window;
        self
    }

    /// Read time from `clock` when judging whether a reset is still ahead.
    /// Should be the same clock the store uses.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Count one request for `client_id` and decide whether it may proceed.
    pub async fn allow(&self, client_id: &str) -> Result<Decision, LimiterError> {
        self.admit(client_id, None).await
    }

    /// Like [`allow`](Self::allow), but give up on the store after `deadline`.
    ///
    /// An expired deadline is reported as a storage failure.
    pub async fn allow_with_deadline(
        &self,
        client_id: &str,
        deadline: Duration,
    ) -> Result<Decision, LimiterError> {
        self.admit(client_id, Some(deadline)).await
    }

    /// Report the decision the next request would get, without counting one.
    pub async fn peek(&self, client_id: &str) -> Result<Decision, LimiterError> {
        let limit = self.resolve(client_id)?;
        let key = self.window.storage_key(client_id);

        match self.store.get(&key).await {
            Ok(entry) => Ok(Decision::observed(limit.requests, &entry, self.clock.now())),
            Err(source) => Err(self.storage_failure(client_id, &limit, source)),
        }
    }

    /// The effective limit for a client, without validating it.
    pub fn limit_for(&self, client_id: &str) -> ClientLimit {
        self.limits.resolve(client_id)
    }

    /// The registry this limiter reads its limits from.
    pub fn limits(&self) -> &Arc<LimitRegistry> {
        &self.limits
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    async fn admit(
        &self,
        client_id: &str,
        deadline: Option<Duration>,
    ) -> Result<Decision, LimiterError> {
        let limit = self.resolve(client_id)?;
        let key = self.window.storage_key(client_id);

        trace!(
            client_id = %client_id,
            key = %key,
            limit = limit.requests,
            window = ?limit.window,
            "Checking rate limit"
        );

        let increment = self.store.increment(&key, self.window.ttl(&limit));
        let counted = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, increment)
                .await
                .unwrap_or_else(|_| {
                    Err(StorageError::Timeout {
                        after: Some(deadline),
                    })
                }),
            None => increment.await,
        };

        let entry = match counted {
            Ok(entry) => entry,
            Err(source) => return Err(self.storage_failure(client_id, &limit, source)),
        };

        let decision = Decision::counted(limit.requests, &entry, self.clock.now());
        if !decision.allowed {
            debug!(
                client_id = %client_id,
                count = entry.count,
                limit = limit.requests,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    fn resolve(&self, client_id: &str) -> Result<ClientLimit, LimiterError> {
        let limit = self.limits.resolve(client_id);
        limit
            .validate()
            .map_err(|reason| LimiterError::Configuration {
                client_id: client_id.to_string(),
                reason,
            })?;
        Ok(limit)
    }

    fn storage_failure(
        &self,
        client_id: &str,
        limit: &ClientLimit,
        source: StorageError,
    ) -> LimiterError {
        warn!(
            client_id = %client_id,
            error = %source,
            policy = ?self.failure_policy,
            "Counter store unavailable, applying failure policy"
        );
        LimiterError::Storage {
            client_id: client_id.to_string(),
            source,
            fallback: self.failure_policy.fallback(limit.requests),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}
