//! Admission decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::CounterEntry;

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests allowed per window for this client
    pub limit: u64,
    /// Requests left in the current window, within `[0, limit]`
    pub remaining: u64,
    /// When the current window ends. `None` means no wait is needed.
    pub reset_at: Option<DateTime<Utc>>,
}

impl Decision {
    /// Decision for a request that has just been counted in `entry`.
    pub fn counted(limit: u64, entry: &CounterEntry, now: DateTime<Utc>) -> Self {
        Self {
            allowed: entry.count <= limit,
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_at: future_expiry(entry, now),
        }
    }

    /// Decision a new request would get, given a counter read without
    /// counting anything.
    pub fn observed(limit: u64, entry: &CounterEntry, now: DateTime<Utc>) -> Self {
        Self {
            allowed: entry.count < limit,
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_at: future_expiry(entry, now),
        }
    }

    /// Stand-in used when the store is unavailable and the policy is to admit.
    pub fn fail_open(limit: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: None,
        }
    }

    /// Stand-in used when the store is unavailable and the policy is to reject.
    pub fn fail_closed(limit: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at: None,
        }
    }

    /// How long until the window resets, if it has not already.
    pub fn reset_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.reset_at.and_then(|at| (at - now).to_std().ok())
    }
}

fn future_expiry(entry: &CounterEntry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    entry.expiry.filter(|expiry| *expiry > now)
}
