//! Rate limiting logic: limits, windows and the admission engine.

pub mod clock;
mod decision;
mod limiter;
mod limits;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use limiter::{FailurePolicy, RateLimiter};
pub use limits::{ClientLimit, LimitRegistry, LimitTable, DEFAULT_REQUESTS, DEFAULT_WINDOW};
pub use window::{FixedWindow, DEFAULT_KEY_PREFIX};
