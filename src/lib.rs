pub mod alert;
pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod monzo;
pub mod store;
pub mod token;
pub mod webhooks;

pub use config::Config;
pub use error::BotError;

use std::sync::Arc;

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub webhooks: webhooks::WebhookService,
}

pub type SharedState = Arc<AppState>;
