//! Request admission middleware.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::LimiterError;
use crate::ratelimit::{Decision, RateLimiter};

/// Header carrying the caller's client identifier.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Identifier used when a request carries no client id.
pub const DEFAULT_CLIENT_ID: &str = "default";

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Client id of a request, or [`DEFAULT_CLIENT_ID`].
pub fn client_id(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CLIENT_ID)
        .to_string()
}

/// Admit or reject the request based on the client's quota.
///
/// Every answered request carries the `X-RateLimit-*` headers. When the
/// store fails, the limiter's failure policy decides: fail-open lets the
/// request through, fail-closed answers 503.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client_id = client_id(request.headers());
    let path = request.uri().path().to_string();

    let decision = match limiter.allow(&client_id).await {
        Ok(decision) => decision,
        Err(LimiterError::Storage {
            source, fallback, ..
        }) => {
            error!(client_id = %client_id, error = %source, "Rate limiter storage failure");
            if !fallback.allowed {
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "Rate limiter unavailable" })),
                )
                    .into_response();
                set_rate_limit_headers(response.headers_mut(), &fallback);
                return response;
            }
            fallback
        }
        Err(err @ LimiterError::Configuration { .. }) => {
            error!(client_id = %client_id, error = %err, "Rate limiter misconfigured");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error" })),
            )
                .into_response();
        }
    };

    if !decision.allowed {
        warn!(
            client_id = %client_id,
            remaining = decision.remaining,
            path = %path,
            "Rate limit exceeded"
        );
        let mut response = too_many_requests(&decision);
        set_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    debug!(
        client_id = %client_id,
        remaining = decision.remaining,
        path = %path,
        "Request allowed"
    );

    let mut response = next.run(request).await;
    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn too_many_requests(decision: &Decision) -> Response {
    let mut body = json!({
        "error": "Rate limit exceeded",
        "remaining": decision.remaining,
    });
    if let Some(reset_at) = decision.reset_at {
        body["reset_at"] = json!(reset_at.timestamp());
    }
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    if let Some(reset_at) = decision.reset_at {
        headers.insert(RESET_HEADER, HeaderValue::from(reset_at.timestamp()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_id(&headers), DEFAULT_CLIENT_ID);

        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(client_id(&headers), DEFAULT_CLIENT_ID);

        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("client-1"));
        assert_eq!(client_id(&headers), "client-1");
    }

    #[test]
    fn test_headers_omit_reset_when_absent() {
        let mut headers = HeaderMap::new();
        set_rate_limit_headers(&mut headers, &Decision::fail_open(10));

        assert_eq!(headers[&LIMIT_HEADER], "10");
        assert_eq!(headers[&REMAINING_HEADER], "10");
        assert!(headers.get(&RESET_HEADER).is_none());
    }
}
