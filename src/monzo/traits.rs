use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tokens returned by the Monzo token endpoint after a refresh-token grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// Monzo rotates refresh tokens; absent means "keep the one you have".
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// The parts of a Monzo transaction the bot cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub account_id: String,
    pub notes: String,
}

/// A basic feed item as rendered in the Monzo app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub body: String,
    pub url: String,
    pub background_color: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MonzoError {
    /// The refresh token was revoked, expired or never valid. Not retryable.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// The refresh token was already exchanged by someone else.
    #[error("refresh token evicted")]
    Evicted,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Network failure, timeout, 429 or 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl MonzoError {
    /// Short machine-readable code, safe to return to callers.
    pub fn code(&self) -> &'static str {
        match self {
            MonzoError::InvalidGrant(_) => "invalid_grant",
            MonzoError::Evicted => "evicted",
            MonzoError::Unauthorized(_) => "unauthorized",
            MonzoError::Transient(_) => "transient",
            MonzoError::Rejected { .. } => "upstream_rejected",
        }
    }
}

/// The remote operations the bot performs against the Monzo API.
///
/// Each call may fail transiently (`Transient`) or permanently (everything
/// else). Implementations never retry on their own.
#[async_trait]
pub trait MonzoApi: Send + Sync {
    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, MonzoError>;

    /// Current balance of the account in pence.
    async fn get_balance(&self, access_token: &str, account_id: &str) -> Result<i64, MonzoError>;

    async fn get_transaction(
        &self,
        access_token: &str,
        transaction_id: &str,
    ) -> Result<TransactionInfo, MonzoError>;

    async fn post_feed_item(
        &self,
        access_token: &str,
        account_id: &str,
        item: &FeedItem,
    ) -> Result<(), MonzoError>;

    /// Replace the transaction's note with `text`.
    async fn update_transaction_note(
        &self,
        access_token: &str,
        transaction_id: &str,
        text: &str,
    ) -> Result<(), MonzoError>;

    /// Deposit `amount_pence` from the account into a pot. `dedupe_id` makes
    /// repeated deposits with the same id a no-op at Monzo.
    async fn move_to_pot(
        &self,
        access_token: &str,
        account_id: &str,
        pot_id: &str,
        amount_pence: i64,
        dedupe_id: &str,
    ) -> Result<(), MonzoError>;
}
