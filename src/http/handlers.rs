//! Request handlers.

use axum::http::HeaderMap;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use super::middleware::client_id;

#[derive(Debug, Serialize)]
pub struct HelloResponse {
    pub message: String,
    pub client_id: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub time: String,
}

/// Greets a client whose request got through the limiter.
pub async fn hello(headers: HeaderMap) -> Json<HelloResponse> {
    Json(HelloResponse {
        message: "Hello! Your request was successful.".to_string(),
        client_id: client_id(&headers),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// Liveness check. Not rate limited.
pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}
