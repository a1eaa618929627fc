//! Route handlers. Each one translates axum extractors into plain maps and
//! bytes and hands off to the service layer; no business logic lives here.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::SharedState;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/monzo_webhook", post(monzo_webhook))
        .with_state(state)
}

/// GET /status
async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "monzo-balance-bot",
        "version": env!("CARGO_PKG_VERSION"),
        "state_backend": state.config.state_backend.as_str(),
    }))
}

/// POST /monzo_webhook
async fn monzo_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let headers = header_map(&headers);
    let resp = state.webhooks.handle(&headers, &query, &body).await;
    let status = StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(resp.body))
}

/// Headers with non-UTF-8 values are dropped.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
