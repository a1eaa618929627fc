//! Monzo `transaction.created` webhook pipeline.
//!
//! Order of operations per delivery:
//! secret check → payload validation → account filter → dedupe mark →
//! access token → (optional) transaction verification → balance →
//! alert evaluation → side effects (best-effort) → persist alert state.
//!
//! The service is transport-agnostic: it takes header/query maps and the raw
//! body, and returns a status code plus a JSON-serialisable body.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::alert::{Action, AlertLevel, AlertService, CommitmentSnapshot};
use crate::auth::verify_webhook_secret;
use crate::config::Config;
use crate::error::BotError;
use crate::monzo::{FeedItem, MonzoApi};
use crate::store::{AlertStateStore, DedupeStore};
use crate::token::TokenService;

const TRANSACTION_CREATED: &str = "transaction.created";
const FEED_ITEM_BODY: &str = "Tap to view transaction details";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status_code: u16,
    pub body: WebhookBody,
}

impl WebhookResponse {
    fn ok(body: WebhookBody) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookBody {
    pub status: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl WebhookBody {
    pub fn failure(err: &BotError) -> Self {
        Self {
            status: err.reason_code().to_string(),
            detail: err.public_detail().to_string(),
            summary: None,
        }
    }

    fn outcome(status: &str, detail: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            detail: detail.into(),
            summary: None,
        }
    }
}

/// What one processed transaction did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub transaction_id: String,
    pub balance_pence: i64,
    pub level: AlertLevel,
    pub alerted: bool,
    pub actions: Vec<Action>,
    /// Actions that were attempted but failed, as `"<action>: <error code>"`.
    pub failed_actions: Vec<String>,
}

// =============================================================================
// Event parsing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct TransactionEvent {
    transaction_id: String,
    account_id: String,
    merchant: Option<String>,
    description: Option<String>,
}

impl TransactionEvent {
    fn parse(body: &[u8]) -> Result<Self, BotError> {
        let event: Value = serde_json::from_slice(body)
            .map_err(|e| BotError::Validation(format!("body is not JSON: {e}")))?;

        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BotError::Validation("missing event type".into()))?;
        if event_type != TRANSACTION_CREATED {
            return Err(BotError::Validation(format!(
                "unsupported event type: {event_type}"
            )));
        }

        let data = event
            .get("data")
            .filter(|d| d.is_object())
            .ok_or_else(|| BotError::Validation("missing data object".into()))?;

        // `merchant` is an object when expanded, a bare id or null otherwise.
        let merchant = data
            .get("merchant")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            transaction_id: str_field(data, "id")?,
            account_id: str_field(data, "account_id")?,
            merchant,
            description: data
                .get("description")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    fn merchant_label(&self) -> &str {
        self.merchant
            .as_deref()
            .or(self.description.as_deref())
            .unwrap_or("Unknown")
    }
}

fn str_field(data: &Value, key: &str) -> Result<String, BotError> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BotError::Validation(format!("data.{key} missing or not a string")))
}

/// `£12.34`, `-£0.50`.
fn format_pounds(pence: i64) -> String {
    let sign = if pence < 0 { "-" } else { "" };
    let abs = pence.unsigned_abs();
    format!("{sign}£{}.{:02}", abs / 100, abs % 100)
}

fn alert_title(level: AlertLevel, merchant: &str, balance_pence: i64) -> String {
    format!(
        "{}: Spent at {} Balance: {}",
        level.title_prefix(),
        merchant,
        format_pounds(balance_pence)
    )
}

fn sweep_dedupe_id(account_id: &str, period: impl std::fmt::Display) -> String {
    format!("commitments-sweep-{account_id}-{period}")
}

// =============================================================================
// Service
// =============================================================================

pub struct WebhookService {
    tokens: Arc<TokenService>,
    monzo: Arc<dyn MonzoApi>,
    alerts: AlertService,
    alert_store: Arc<dyn AlertStateStore>,
    dedupe: Arc<dyn DedupeStore>,
    commitments: CommitmentSnapshot,
    account_id: String,
    webhook_secret: String,
    allow_query_secret: bool,
    verify_transactions: bool,
    seen_ttl: Duration,
    clock: Clock,
}

impl WebhookService {
    pub fn new(
        config: &Config,
        tokens: Arc<TokenService>,
        monzo: Arc<dyn MonzoApi>,
        alerts: AlertService,
        alert_store: Arc<dyn AlertStateStore>,
        dedupe: Arc<dyn DedupeStore>,
    ) -> Self {
        Self {
            tokens,
            monzo,
            alerts,
            alert_store,
            dedupe,
            commitments: CommitmentSnapshot::new(config.commitments.clone()),
            account_id: config.account_id.clone(),
            webhook_secret: config.webhook_secret.clone(),
            allow_query_secret: config.allow_query_secret,
            verify_transactions: config.verify_transactions,
            seen_ttl: config.seen_ttl,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for evaluation (month boundaries).
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Handle one delivery. Never panics and never returns an error: every
    /// failure is mapped to a status code and a generic body.
    pub async fn handle(
        &self,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> WebhookResponse {
        match self.process(headers, query, body).await {
            Ok(body) => WebhookResponse::ok(body),
            Err(e) => {
                match &e {
                    BotError::Authentication => warn!("[Webhook] Rejected unauthenticated delivery"),
                    BotError::Validation(msg) => warn!("[Webhook] Invalid payload: {msg}"),
                    other => error!("[Webhook] Processing failed: {other}"),
                }
                WebhookResponse {
                    status_code: e.status_code().as_u16(),
                    body: WebhookBody::failure(&e),
                }
            }
        }
    }

    async fn process(
        &self,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<WebhookBody, BotError> {
        verify_webhook_secret(headers, query, &self.webhook_secret, self.allow_query_secret)?;

        let event = TransactionEvent::parse(body)?;
        let tx_id = event.transaction_id.as_str();

        if event.account_id != self.account_id {
            debug!("[Webhook] Ignoring {tx_id} for account {}", event.account_id);
            return Ok(WebhookBody::outcome("ignored", "transaction is for another account"));
        }

        if !self.dedupe.check_and_mark(tx_id, self.seen_ttl).await? {
            info!("[Webhook] Duplicate delivery of {tx_id}, skipping");
            return Ok(WebhookBody::outcome("duplicate", "transaction already processed"));
        }

        let access_token = self.tokens.get_valid_token().await?;

        let existing_note = if self.verify_transactions {
            let tx = self.monzo.get_transaction(&access_token, tx_id).await.map_err(|e| {
                error!("[Webhook] Transaction lookup failed for {tx_id}: {e}");
                BotError::from(e)
            })?;
            if tx.account_id != self.account_id {
                warn!("[Webhook] {tx_id} belongs to {} at Monzo, ignoring", tx.account_id);
                return Ok(WebhookBody::outcome("ignored", "transaction could not be verified"));
            }
            tx.notes
        } else {
            String::new()
        };

        let balance_pence = self
            .monzo
            .get_balance(&access_token, &self.account_id)
            .await
            .map_err(|e| {
                error!("[Webhook] Balance fetch failed for {tx_id}: {e}");
                BotError::from(e)
            })?;

        let prior = self
            .alert_store
            .load_alert_state(&self.account_id)
            .await?
            .map(|v| v.value)
            .unwrap_or_default();

        let now = (self.clock)();
        let evaluation =
            self.alerts
                .evaluate(&prior, balance_pence, now, &self.commitments, Some(tx_id));

        let title = alert_title(evaluation.state.level, event.merchant_label(), balance_pence);
        let mut failed_actions = Vec::new();
        for action in &evaluation.actions {
            if let Err(e) = self
                .execute(action, &access_token, &event, &title, &existing_note)
                .await
            {
                error!("[Webhook] Action {action:?} failed for {tx_id}: {e}");
                failed_actions.push(format!("{}: {}", action_name(action), e.code()));
            }
        }

        self.alert_store
            .save_alert_state(&self.account_id, &evaluation.state)
            .await?;

        info!(
            "[Webhook] Processed {tx_id}: balance={} level={:?} actions={} failed={}",
            balance_pence,
            evaluation.state.level,
            evaluation.actions.len(),
            failed_actions.len()
        );

        Ok(WebhookBody {
            status: "processed".into(),
            detail: format!("balance {}", format_pounds(balance_pence)),
            summary: Some(Summary {
                transaction_id: event.transaction_id.clone(),
                balance_pence,
                level: evaluation.state.level,
                alerted: evaluation.alerted(),
                actions: evaluation.actions.clone(),
                failed_actions,
            }),
        })
    }

    async fn execute(
        &self,
        action: &Action,
        access_token: &str,
        event: &TransactionEvent,
        title: &str,
        existing_note: &str,
    ) -> Result<(), crate::monzo::MonzoError> {
        match action {
            Action::PostFeedItem { level } => {
                let item = FeedItem {
                    title: title.to_string(),
                    body: FEED_ITEM_BODY.to_string(),
                    url: format!("monzo://transaction/{}", event.transaction_id),
                    background_color: level.color().to_string(),
                };
                self.monzo
                    .post_feed_item(access_token, &self.account_id, &item)
                    .await
            }
            Action::UpdateTransactionNote { transaction_id, .. } => {
                let text = if existing_note.trim().is_empty() {
                    title.to_string()
                } else {
                    format!("{title}\n{existing_note}")
                };
                self.monzo
                    .update_transaction_note(access_token, transaction_id, &text)
                    .await
            }
            Action::SweepToPot {
                amount_pence,
                pot_id,
                period,
            } => {
                info!("[Webhook] Sweeping {} to pot {pot_id} for {period}", format_pounds(*amount_pence));
                self.monzo
                    .move_to_pot(
                        access_token,
                        &self.account_id,
                        pot_id,
                        *amount_pence,
                        &sweep_dedupe_id(&self.account_id, period),
                    )
                    .await
            }
        }
    }
}

fn action_name(action: &Action) -> &'static str {
    match action {
        Action::PostFeedItem { .. } => "post_feed_item",
        Action::UpdateTransactionNote { .. } => "update_transaction_note",
        Action::SweepToPot { .. } => "sweep_to_pot",
    }
}
