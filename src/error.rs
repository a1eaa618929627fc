use axum::http::StatusCode;

use crate::monzo::MonzoError;
use crate::store::StoreError;

/// Request-level error for the webhook pipeline.
///
/// Every variant maps to one HTTP status and one short reason code. The
/// `Display` text is for logs only and never reaches the response body.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    // ── Inbound ─────────────────────────────────────────────────────────
    #[error("Webhook secret missing or mismatched")]
    Authentication,

    #[error("Invalid payload: {0}")]
    Validation(String),

    // ── OAuth ───────────────────────────────────────────────────────────
    #[error("OAuth grant rejected: {0}")]
    OAuth(String),

    // ── Monzo API ───────────────────────────────────────────────────────
    #[error("Monzo API error: {0}")]
    Upstream(String),

    // ── Persistence ─────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BotError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BotError::Authentication => StatusCode::UNAUTHORIZED,
            BotError::Validation(_) => StatusCode::BAD_REQUEST,
            BotError::OAuth(_) => StatusCode::UNAUTHORIZED,
            BotError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BotError::Storage(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Machine-readable reason code placed in the response body.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BotError::Authentication => "unauthorized",
            BotError::Validation(_) => "invalid_payload",
            BotError::OAuth(_) => "oauth_unauthorized",
            BotError::Upstream(_) => "upstream_error",
            BotError::Storage(_) => "storage_error",
        }
    }

    /// Short public description. Deliberately generic.
    pub fn public_detail(&self) -> &'static str {
        match self {
            BotError::Authentication => "webhook secret rejected",
            BotError::Validation(_) => "payload is not a transaction.created event",
            BotError::OAuth(_) => "monzo authorisation is no longer valid",
            BotError::Upstream(_) => "monzo api unavailable",
            BotError::Storage(_) => "state backend unavailable",
        }
    }
}

impl From<StoreError> for BotError {
    fn from(e: StoreError) -> Self {
        BotError::Storage(e.to_string())
    }
}

impl From<MonzoError> for BotError {
    fn from(e: MonzoError) -> Self {
        match e {
            MonzoError::InvalidGrant(_) | MonzoError::Unauthorized(_) => {
                BotError::OAuth(e.to_string())
            }
            _ => BotError::Upstream(e.to_string()),
        }
    }
}
