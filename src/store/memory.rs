//! Process-local backend for development and tests.
//!
//! Each record carries a monotonically increasing version used as its
//! concurrency tag, so compare-and-swap behaves like the durable backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{AlertStateStore, ConcurrencyTag, DedupeStore, StoreError, TokenStore, Versioned};
use crate::alert::AlertState;
use crate::token::TokenState;

struct Record<T> {
    value: T,
    version: u64,
}

impl<T: Clone> Record<T> {
    fn versioned(&self) -> Versioned<T> {
        Versioned {
            value: self.value.clone(),
            tag: tag(self.version),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tokens: Mutex<HashMap<String, Record<TokenState>>>,
    alerts: Mutex<HashMap<String, Record<AlertState>>>,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful token writes for an account.
    #[cfg(test)]
    pub async fn token_writes(&self, account_id: &str) -> u64 {
        self.tokens
            .lock()
            .await
            .get(account_id)
            .map(|r| r.version)
            .unwrap_or(0)
    }
}

fn tag(version: u64) -> ConcurrencyTag {
    ConcurrencyTag::new(format!("mem-{version}"))
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn load_token(
        &self,
        account_id: &str,
    ) -> Result<Option<Versioned<TokenState>>, StoreError> {
        Ok(self.tokens.lock().await.get(account_id).map(Record::versioned))
    }

    async fn save_token(
        &self,
        account_id: &str,
        state: &TokenState,
        expected: Option<&ConcurrencyTag>,
    ) -> Result<ConcurrencyTag, StoreError> {
        let mut tokens = self.tokens.lock().await;
        let next = match (tokens.get(account_id), expected) {
            (None, None) => 1,
            (Some(current), Some(expected)) if tag(current.version) == *expected => {
                current.version + 1
            }
            _ => return Err(StoreError::Conflict),
        };
        tokens.insert(
            account_id.to_string(),
            Record {
                value: state.clone(),
                version: next,
            },
        );
        Ok(tag(next))
    }
}

#[async_trait]
impl AlertStateStore for MemoryStore {
    async fn load_alert_state(
        &self,
        account_id: &str,
    ) -> Result<Option<Versioned<AlertState>>, StoreError> {
        Ok(self.alerts.lock().await.get(account_id).map(Record::versioned))
    }

    async fn save_alert_state(
        &self,
        account_id: &str,
        state: &AlertState,
    ) -> Result<ConcurrencyTag, StoreError> {
        let mut alerts = self.alerts.lock().await;
        let next = alerts.get(account_id).map(|r| r.version + 1).unwrap_or(1);
        alerts.insert(
            account_id.to_string(),
            Record {
                value: state.clone(),
                version: next,
            },
        );
        Ok(tag(next))
    }
}

#[async_trait]
impl DedupeStore for MemoryStore {
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        // Oversized TTLs saturate to "never expires".
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // Check and insert under one lock acquisition.
        let mut seen = self.seen.lock().await;
        match seen.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                seen.insert(key.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        Ok((before - seen.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertLevel, YearMonth};
    use std::sync::Arc;

    fn token(access: &str) -> TokenState {
        TokenState {
            access_token: access.into(),
            refresh_token: format!("refresh_for_{access}"),
            expires_at: Utc::now() + chrono::Duration::hours(6),
        }
    }

    #[tokio::test]
    async fn test_token_cas_create_only_once() {
        let store = MemoryStore::new();
        let first = store.save_token("acc", &token("a1"), None).await.unwrap();
        let second = store.save_token("acc", &token("a2"), None).await;
        assert!(matches!(second, Err(StoreError::Conflict)));

        let loaded = store.load_token("acc").await.unwrap().unwrap();
        assert_eq!(loaded.value.access_token, "a1");
        assert_eq!(loaded.tag, first);
    }

    #[tokio::test]
    async fn test_token_cas_rejects_stale_tag() {
        let store = MemoryStore::new();
        let t1 = store.save_token("acc", &token("a1"), None).await.unwrap();
        let t2 = store.save_token("acc", &token("a2"), Some(&t1)).await.unwrap();
        assert_ne!(t1, t2);

        let stale = store.save_token("acc", &token("a3"), Some(&t1)).await;
        assert!(matches!(stale, Err(StoreError::Conflict)));
        let loaded = store.load_token("acc").await.unwrap().unwrap();
        assert_eq!(loaded.value.access_token, "a2");
    }

    #[tokio::test]
    async fn test_alert_state_last_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.load_alert_state("acc").await.unwrap().is_none());

        let state = AlertState {
            level: AlertLevel::Critical,
            qualifying_tx_since_last_alert: 0,
            last_sweep: Some(YearMonth { year: 2026, month: 10 }),
        };
        store.save_alert_state("acc", &AlertState::default()).await.unwrap();
        store.save_alert_state("acc", &state).await.unwrap();

        let loaded = store.load_alert_state("acc").await.unwrap().unwrap();
        assert_eq!(loaded.value, state);
    }

    #[tokio::test]
    async fn test_dedupe_marks_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(600);
        assert!(store.check_and_mark("tx_1", ttl).await.unwrap());
        assert!(!store.check_and_mark("tx_1", ttl).await.unwrap());
        assert!(store.check_and_mark("tx_2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_dedupe_expired_marker_is_eligible_again() {
        let store = MemoryStore::new();
        assert!(store.check_and_mark("tx_1", Duration::ZERO).await.unwrap());
        assert!(store.check_and_mark("tx_1", Duration::ZERO).await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dedupe_huge_ttl_saturates() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(u64::MAX / 2);
        assert!(store.check_and_mark("tx_forever", ttl).await.unwrap());
        assert!(!store.check_and_mark("tx_forever", ttl).await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dedupe_concurrent_marks_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.check_and_mark("tx_same", Duration::from_secs(600)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
