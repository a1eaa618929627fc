use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::traits::{FeedItem, MonzoApi, MonzoError, TokenSet, TransactionInfo};

const FEED_IMAGE_URL: &str = "https://cdn-icons-png.flaticon.com/512/564/564619.png";
const FEED_TITLE_COLOR: &str = "#333333";

/// Monzo REST API client.
///
/// Every request carries the configured connect and total timeouts; a timeout
/// surfaces as `MonzoError::Transient`.
pub struct MonzoClient {
    base_url: String,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

// Raw token response from Monzo's token endpoint
#[derive(Debug, Deserialize)]
struct MonzoTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TransactionEnvelope {
    transaction: Option<RawTransaction>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    account_id: String,
    #[serde(default)]
    notes: String,
}

impl MonzoClient {
    pub fn new(
        base_url: &str,
        client_id: String,
        client_secret: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, MonzoError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| MonzoError::Transient(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a prepared request and turn any non-2xx answer into a `MonzoError`.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, MonzoError> {
        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

#[async_trait]
impl MonzoApi for MonzoClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, MonzoError> {
        let req = self.http.post(self.url("/oauth2/token")).form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ]);

        let resp = match self.send(req).await {
            Ok(resp) => resp,
            // A plain 400/401 from the token endpoint means the grant itself is bad.
            Err(MonzoError::Rejected { status, body }) if status == 400 => {
                return Err(MonzoError::InvalidGrant(body));
            }
            Err(MonzoError::Unauthorized(body)) => return Err(MonzoError::InvalidGrant(body)),
            Err(e) => return Err(e),
        };

        let token_resp: MonzoTokenResponse = resp.json().await.map_err(|e| {
            MonzoError::Transient(format!("Failed to parse refresh response: {e}"))
        })?;

        Ok(TokenSet {
            access_token: token_resp.access_token,
            refresh_token: token_resp.refresh_token,
            expires_in: token_resp.expires_in,
        })
    }

    async fn get_balance(&self, access_token: &str, account_id: &str) -> Result<i64, MonzoError> {
        let req = self
            .http
            .get(self.url("/balance"))
            .bearer_auth(access_token)
            .query(&[("account_id", account_id)]);

        let resp: BalanceResponse = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| MonzoError::Transient(format!("Failed to parse balance response: {e}")))?;

        resp.balance
            .ok_or_else(|| MonzoError::Transient("balance response missing balance field".into()))
    }

    async fn get_transaction(
        &self,
        access_token: &str,
        transaction_id: &str,
    ) -> Result<TransactionInfo, MonzoError> {
        let req = self
            .http
            .get(self.url(&format!("/transactions/{transaction_id}")))
            .bearer_auth(access_token);

        let envelope: TransactionEnvelope = self.send(req).await?.json().await.map_err(|e| {
            MonzoError::Transient(format!("Failed to parse transaction response: {e}"))
        })?;

        let tx = envelope
            .transaction
            .ok_or_else(|| MonzoError::Transient("transaction response was empty".into()))?;

        Ok(TransactionInfo {
            account_id: tx.account_id,
            notes: tx.notes,
        })
    }

    async fn post_feed_item(
        &self,
        access_token: &str,
        account_id: &str,
        item: &FeedItem,
    ) -> Result<(), MonzoError> {
        let req = self
            .http
            .post(self.url("/feed"))
            .bearer_auth(access_token)
            .form(&[
                ("account_id", account_id),
                ("type", "basic"),
                ("url", item.url.as_str()),
                ("params[title]", item.title.as_str()),
                ("params[body]", item.body.as_str()),
                ("params[image_url]", FEED_IMAGE_URL),
                ("params[background_color]", item.background_color.as_str()),
                ("params[title_color]", FEED_TITLE_COLOR),
            ]);

        self.send(req).await?;
        Ok(())
    }

    async fn update_transaction_note(
        &self,
        access_token: &str,
        transaction_id: &str,
        text: &str,
    ) -> Result<(), MonzoError> {
        let req = self
            .http
            .patch(self.url(&format!("/transactions/{transaction_id}")))
            .bearer_auth(access_token)
            .form(&[("metadata[notes]", text)]);

        self.send(req).await?;
        Ok(())
    }

    async fn move_to_pot(
        &self,
        access_token: &str,
        account_id: &str,
        pot_id: &str,
        amount_pence: i64,
        dedupe_id: &str,
    ) -> Result<(), MonzoError> {
        let amount = amount_pence.to_string();
        let req = self
            .http
            .put(self.url(&format!("/pots/{pot_id}/deposit")))
            .bearer_auth(access_token)
            .form(&[
                ("source_account_id", account_id),
                ("amount", amount.as_str()),
                ("dedupe_id", dedupe_id),
            ]);

        self.send(req).await?;
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> MonzoError {
    if e.is_timeout() {
        MonzoError::Transient(format!("request timed out: {e}"))
    } else {
        MonzoError::Transient(format!("request failed: {e}"))
    }
}

/// Map a non-success status (and body) onto the error taxonomy.
fn classify(status: StatusCode, body: &str) -> MonzoError {
    if status == StatusCode::BAD_REQUEST && body.contains("evicted") {
        return MonzoError::Evicted;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return MonzoError::Transient(format!("HTTP {}", status.as_u16()));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return MonzoError::Unauthorized(format!("HTTP {}", status.as_u16()));
    }
    MonzoError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    }
}
