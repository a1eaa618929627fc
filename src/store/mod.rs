//! State stores for token state, alert state and the dedupe set.
//!
//! Two backends implement all three traits: `MemoryStore` for dev and tests,
//! and `PgStore` (PostgreSQL) for deployments with more than one instance.
//! All cross-request coordination happens here, never in process-local locks
//! held by the services.

pub mod db;
pub mod memory;
pub mod refresh;

use std::time::Duration;

use async_trait::async_trait;

use crate::alert::AlertState;
use crate::token::TokenState;

pub use db::PgStore;
pub use memory::MemoryStore;
pub use refresh::keepalive_daemon;

/// Opaque, backend-supplied version marker. Changes on every successful
/// write; only ever compared, never interpreted outside its backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConcurrencyTag(String);

impl ConcurrencyTag {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A stored record together with the tag it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub tag: ConcurrencyTag,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Compare-and-swap lost: the record changed since it was read.
    #[error("concurrent modification detected")]
    Conflict,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_token(&self, account_id: &str)
        -> Result<Option<Versioned<TokenState>>, StoreError>;

    /// Compare-and-swap write.
    ///
    /// `expected = Some(tag)` succeeds only if the record is still at `tag`;
    /// `expected = None` succeeds only if no record exists yet. Any mismatch
    /// returns `StoreError::Conflict` and leaves the stored record untouched.
    async fn save_token(
        &self,
        account_id: &str,
        state: &TokenState,
        expected: Option<&ConcurrencyTag>,
    ) -> Result<ConcurrencyTag, StoreError>;
}

#[async_trait]
pub trait AlertStateStore: Send + Sync {
    async fn load_alert_state(
        &self,
        account_id: &str,
    ) -> Result<Option<Versioned<AlertState>>, StoreError>;

    /// Unconditional write (last writer wins).
    async fn save_alert_state(
        &self,
        account_id: &str,
        state: &AlertState,
    ) -> Result<ConcurrencyTag, StoreError>;
}

#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Atomically check for `key` and mark it as seen for `ttl`.
    ///
    /// Returns `true` if the key was absent or expired (the caller now owns
    /// processing), `false` if it is present and unexpired. Two concurrent
    /// calls for the same key never both return `true`.
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop expired markers. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
