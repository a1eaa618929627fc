//! Scripted in-memory `MonzoApi` for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Barrier;

use super::traits::{FeedItem, MonzoApi, MonzoError, TokenSet, TransactionInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Refresh(String),
    Balance,
    Transaction(String),
    Feed(FeedItem),
    Note { transaction_id: String, text: String },
    Pot { pot_id: String, amount_pence: i64, dedupe_id: String },
}

pub struct FakeMonzo {
    calls: Mutex<Vec<Call>>,
    balances: Mutex<VecDeque<i64>>,
    default_balance: i64,
    refresh_count: AtomicUsize,
    pub refresh_error: Mutex<Option<MonzoError>>,
    pub balance_error: Mutex<Option<MonzoError>>,
    pub feed_error: Mutex<Option<MonzoError>>,
    pub transaction_account: Mutex<Option<String>>,
    pub existing_note: Mutex<String>,
    pub refresh_expires_in: Mutex<Option<u64>>,
    /// When set, every refresh waits here so concurrent callers overlap.
    pub refresh_barrier: Option<Arc<Barrier>>,
}

impl FakeMonzo {
    pub fn new(default_balance: i64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            balances: Mutex::new(VecDeque::new()),
            default_balance,
            refresh_count: AtomicUsize::new(0),
            refresh_error: Mutex::new(None),
            balance_error: Mutex::new(None),
            feed_error: Mutex::new(None),
            transaction_account: Mutex::new(None),
            existing_note: Mutex::new(String::new()),
            refresh_expires_in: Mutex::new(Some(21_600)),
            refresh_barrier: None,
        }
    }

    pub fn with_refresh_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.refresh_barrier = Some(barrier);
        self
    }

    /// Queue balances returned by successive `get_balance` calls.
    pub fn push_balances(&self, balances: &[i64]) {
        self.balances.lock().unwrap().extend(balances.iter().copied());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Calls that change something on the Monzo side.
    pub fn side_effects(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Feed(_) | Call::Note { .. } | Call::Pot { .. }))
            .collect()
    }

    pub fn feed_items(&self) -> Vec<FeedItem> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Feed(item) => Some(item),
                _ => None,
            })
            .collect()
    }

    pub fn pot_moves(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Pot { .. }))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MonzoApi for FakeMonzo {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, MonzoError> {
        self.record(Call::Refresh(refresh_token.to_string()));
        if let Some(barrier) = &self.refresh_barrier {
            barrier.wait().await;
        }
        if let Some(err) = self.refresh_error.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenSet {
            access_token: format!("access_{n}"),
            refresh_token: Some(format!("refresh_{n}")),
            expires_in: *self.refresh_expires_in.lock().unwrap(),
        })
    }

    async fn get_balance(&self, _access_token: &str, _account_id: &str) -> Result<i64, MonzoError> {
        self.record(Call::Balance);
        if let Some(err) = self.balance_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_balance))
    }

    async fn get_transaction(
        &self,
        _access_token: &str,
        transaction_id: &str,
    ) -> Result<TransactionInfo, MonzoError> {
        self.record(Call::Transaction(transaction_id.to_string()));
        let account_id = self
            .transaction_account
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "acc_test".into());
        Ok(TransactionInfo {
            account_id,
            notes: self.existing_note.lock().unwrap().clone(),
        })
    }

    async fn post_feed_item(
        &self,
        _access_token: &str,
        _account_id: &str,
        item: &FeedItem,
    ) -> Result<(), MonzoError> {
        self.record(Call::Feed(item.clone()));
        match self.feed_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn update_transaction_note(
        &self,
        _access_token: &str,
        transaction_id: &str,
        text: &str,
    ) -> Result<(), MonzoError> {
        self.record(Call::Note {
            transaction_id: transaction_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn move_to_pot(
        &self,
        _access_token: &str,
        _account_id: &str,
        pot_id: &str,
        amount_pence: i64,
        dedupe_id: &str,
    ) -> Result<(), MonzoError> {
        self.record(Call::Pot {
            pot_id: pot_id.to_string(),
            amount_pence,
            dedupe_id: dedupe_id.to_string(),
        });
        Ok(())
    }
}
