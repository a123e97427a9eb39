//! HTTP surface: a rate-limited API route and a status endpoint.

mod handlers;
mod middleware;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::ratelimit::RateLimiter;

pub use handlers::{hello, status, HelloResponse, StatusResponse};
pub use middleware::{
    client_id, rate_limit, CLIENT_ID_HEADER, DEFAULT_CLIENT_ID, LIMIT_HEADER, REMAINING_HEADER,
    RESET_HEADER,
};

/// Build the service router.
///
/// Only `/api/*` routes pass through the rate limiter.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    let api = Router::new()
        .route("/api/hello", get(hello))
        .route_layer(axum::middleware::from_fn_with_state(limiter, rate_limit));

    Router::new().route("/status", get(status)).merge(api)
}
