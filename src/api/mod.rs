//! HTTP transport for the bot.
//!
//! - POST /monzo_webhook: Monzo `transaction.created` deliveries
//! - GET /status: health check

pub mod routes;

use crate::SharedState;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    routes::router(state).layer(TraceLayer::new_for_http())
}
