//! Gatekeeper - Fixed-Window Rate Limiting
//!
//! This crate decides, per client, whether a request may proceed given a
//! quota of N requests per window. Counter state lives either in process
//! memory or in a shared Redis instance so that several service instances
//! enforce one quota.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;

pub use error::{Error, LimiterError, Result, StorageError};
pub use ratelimit::{ClientLimit, Decision, FailurePolicy, LimitRegistry, LimitTable, RateLimiter};
