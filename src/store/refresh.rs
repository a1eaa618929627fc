//! Background token keepalive.
//!
//! Runs every `interval`. Asks the token service for a valid token (which
//! refreshes it if it is inside the expiry margin) and purges expired dedupe
//! markers. Webhook traffic does not depend on this loop; it only keeps the
//! refresh token from going stale on quiet accounts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::DedupeStore;
use crate::token::TokenService;

/// Start the keepalive loop. Never returns.
pub async fn keepalive_daemon(
    tokens: Arc<TokenService>,
    dedupe: Arc<dyn DedupeStore>,
    interval: Duration,
) {
    info!("Token keepalive daemon started (interval: {}s)", interval.as_secs());

    loop {
        tokio::time::sleep(interval).await;
        keepalive_cycle(&tokens, dedupe.as_ref()).await;
    }
}

async fn keepalive_cycle(tokens: &TokenService, dedupe: &dyn DedupeStore) {
    if let Err(e) = tokens.get_valid_token().await {
        error!("Keepalive token check failed: {e}");
    }

    match dedupe.purge_expired().await {
        Ok(0) => {}
        Ok(n) => debug!("Purged {n} expired dedupe markers"),
        Err(e) => error!("Dedupe purge failed: {e}"),
    }
}
