//! OAuth token lifecycle for the monitored account.
//!
//! Refreshes are coordinated through the token store's compare-and-swap: at
//! most one refresh result becomes durable per cycle, and a caller that loses
//! the race adopts the winner's token instead of failing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::BotError;
use crate::monzo::{MonzoApi, MonzoError};
use crate::store::{StoreError, TokenStore};

/// Monzo's documented access-token lifetime, used when `expires_in` is absent.
const DEFAULT_EXPIRES_IN_SECS: u64 = 6 * 60 * 60;
/// Longest lifetime taken at face value; larger answers fall back to the default.
const MAX_EXPIRES_IN_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Empty until the first refresh has been persisted.
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// Placeholder state built from the configured refresh token on first run.
    pub fn seed(refresh_token: &str) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.to_string(),
            expires_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// True if the access token outlives `now + margin`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        !self.access_token.is_empty() && now + margin < self.expires_at
    }
}

pub struct TokenService {
    store: Arc<dyn TokenStore>,
    monzo: Arc<dyn MonzoApi>,
    account_id: String,
    fallback_refresh_token: String,
    margin: chrono::Duration,
    /// Upper bound of the random pause between contended attempts.
    max_backoff: Duration,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        monzo: Arc<dyn MonzoApi>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            monzo,
            account_id: config.account_id.clone(),
            fallback_refresh_token: config.fallback_refresh_token.clone(),
            margin: chrono::Duration::from_std(config.token_expiry_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            max_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Return an access token valid for at least the safety margin,
    /// refreshing (and persisting) a new one if needed.
    pub async fn get_valid_token(&self) -> Result<String, BotError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.store.load_token(&self.account_id).await?;
            let (state, tag) = match current {
                Some(v) => (v.value, Some(v.tag)),
                None => {
                    info!("No stored token state, seeding from configured refresh token");
                    (TokenState::seed(&self.fallback_refresh_token), None)
                }
            };

            if state.is_fresh(Utc::now(), self.margin) {
                return Ok(state.access_token);
            }

            let tokens = match self.monzo.refresh(&state.refresh_token).await {
                Ok(tokens) => tokens,
                Err(MonzoError::Evicted) => {
                    warn!("Refresh token evicted (attempt {attempt}), another instance likely refreshed it");
                    if let Some(token) = self.adopt_fresh().await? {
                        return Ok(token);
                    }
                    self.backoff().await;
                    continue;
                }
                Err(e @ (MonzoError::InvalidGrant(_) | MonzoError::Unauthorized(_))) => {
                    error!("Monzo rejected the refresh token: {e}");
                    return Err(BotError::OAuth(e.to_string()));
                }
                Err(e) => {
                    error!("Token refresh failed: {e}");
                    return Err(BotError::Upstream(e.to_string()));
                }
            };

            let refreshed = TokenState {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token.unwrap_or(state.refresh_token),
                expires_at: expiry_after(Utc::now(), tokens.expires_in),
            };

            match self
                .store
                .save_token(&self.account_id, &refreshed, tag.as_ref())
                .await
            {
                Ok(_) => {
                    info!("Refreshed Monzo access token, expires at {}", refreshed.expires_at);
                    return Ok(refreshed.access_token);
                }
                Err(StoreError::Conflict) => {
                    info!("Token write lost a concurrent refresh (attempt {attempt}), re-reading");
                    if let Some(token) = self.adopt_fresh().await? {
                        return Ok(token);
                    }
                    self.backoff().await;
                }
                Err(e) => {
                    // The old refresh token is spent at Monzo; only the
                    // unsaved one is valid now.
                    error!("Failed to persist refreshed token: {e}");
                    return Err(e.into());
                }
            }
        }

        Err(BotError::Storage(format!(
            "token refresh still contended after {MAX_ATTEMPTS} attempts"
        )))
    }

    /// Re-read the store and return its access token if it is fresh.
    async fn adopt_fresh(&self) -> Result<Option<String>, BotError> {
        let current = self.store.load_token(&self.account_id).await?;
        Ok(current
            .map(|v| v.value)
            .filter(|state| state.is_fresh(Utc::now(), self.margin))
            .map(|state| state.access_token))
    }

    async fn backoff(&self) {
        let max = self.max_backoff.as_millis() as u64;
        if max == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(max / 5..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Expiry instant for a freshly issued token. The old refresh token is already
/// spent by the time this runs, so a bogus `expires_in` must never fail here.
fn expiry_after(now: DateTime<Utc>, expires_in: Option<u64>) -> DateTime<Utc> {
    let secs = match expires_in {
        Some(secs) if secs <= MAX_EXPIRES_IN_SECS => secs,
        Some(secs) => {
            warn!("Ignoring implausible expires_in={secs}s, assuming {DEFAULT_EXPIRES_IN_SECS}s");
            DEFAULT_EXPIRES_IN_SECS
        }
        None => DEFAULT_EXPIRES_IN_SECS,
    };
    // Bounded by MAX_EXPIRES_IN_SECS, so the cast and the addition cannot overflow.
    now + chrono::Duration::seconds(secs as i64)
}
