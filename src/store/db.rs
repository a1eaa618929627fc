//! PostgreSQL-backed state store.
//!
//! Tables:
//! - `bot_token_state`: encrypted token pair per account, with a `version` column used as the concurrency tag
//! - `bot_alert_state`: alert level, cadence counter and sweep marker per account
//! - `bot_seen_transactions`: dedupe markers with an expiry
//!
//! Every conditional write is a single statement, so correctness holds with
//! any number of service instances sharing the database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::{AlertStateStore, ConcurrencyTag, DedupeStore, StoreError, TokenStore, Versioned};
use crate::alert::{AlertLevel, AlertState, YearMonth};
use crate::crypto::CryptoEngine;
use crate::token::TokenState;

pub struct PgStore {
    pool: PgPool,
    crypto: CryptoEngine,
}

impl PgStore {
    pub async fn new(db_url: &str, crypto: CryptoEngine) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool, crypto })
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_token_state (
                account_id      TEXT PRIMARY KEY,
                access_token    TEXT NOT NULL,
                refresh_token   TEXT NOT NULL,
                expires_at      TIMESTAMPTZ NOT NULL,
                version         BIGINT NOT NULL DEFAULT 1,
                updated_at      TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_alert_state (
                account_id        TEXT PRIMARY KEY,
                level             SMALLINT NOT NULL DEFAULT 0,
                qualifying_tx     INT NOT NULL DEFAULT 0,
                last_sweep_month  TEXT,
                version           BIGINT NOT NULL DEFAULT 1,
                updated_at        TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_seen_transactions (
                transaction_id  TEXT PRIMARY KEY,
                seen_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at      TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bot_seen_expiry ON bot_seen_transactions(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Expose the pool for tests and health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, StoreError> {
        self.crypto
            .encrypt(plaintext)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, StoreError> {
        self.crypto
            .decrypt(ciphertext)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

fn version_tag(version: i64) -> ConcurrencyTag {
    ConcurrencyTag::new(version.to_string())
}

#[async_trait]
impl TokenStore for PgStore {
    async fn load_token(
        &self,
        account_id: &str,
    ) -> Result<Option<Versioned<TokenState>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT access_token, refresh_token, expires_at, version
            FROM bot_token_state
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let enc_access: String = row.get(0);
        let enc_refresh: String = row.get(1);
        let expires_at: DateTime<Utc> = row.get(2);
        let version: i64 = row.get(3);

        Ok(Some(Versioned {
            value: TokenState {
                access_token: self.decrypt(&enc_access)?,
                refresh_token: self.decrypt(&enc_refresh)?,
                expires_at,
            },
            tag: version_tag(version),
        }))
    }

    async fn save_token(
        &self,
        account_id: &str,
        state: &TokenState,
        expected: Option<&ConcurrencyTag>,
    ) -> Result<ConcurrencyTag, StoreError> {
        let enc_access = self.encrypt(&state.access_token)?;
        let enc_refresh = self.encrypt(&state.refresh_token)?;

        let row = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO bot_token_state
                        (account_id, access_token, refresh_token, expires_at, version)
                    VALUES ($1, $2, $3, $4, 1)
                    ON CONFLICT (account_id) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(account_id)
                .bind(&enc_access)
                .bind(&enc_refresh)
                .bind(state.expires_at)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(tag) => {
                // A tag this backend did not issue can never match.
                let Ok(expected_version) = tag.as_str().parse::<i64>() else {
                    return Err(StoreError::Conflict);
                };
                sqlx::query(
                    r#"
                    UPDATE bot_token_state
                    SET access_token = $2,
                        refresh_token = $3,
                        expires_at = $4,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE account_id = $1 AND version = $5
                    RETURNING version
                    "#,
                )
                .bind(account_id)
                .bind(&enc_access)
                .bind(&enc_refresh)
                .bind(state.expires_at)
                .bind(expected_version)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(version_tag(row.get(0))),
            None => Err(StoreError::Conflict),
        }
    }
}

#[async_trait]
impl AlertStateStore for PgStore {
    async fn load_alert_state(
        &self,
        account_id: &str,
    ) -> Result<Option<Versioned<AlertState>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT level, qualifying_tx, last_sweep_month, version
            FROM bot_alert_state
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let raw_level: i16 = row.get(0);
        let qualifying: i32 = row.get(1);
        let last_sweep: Option<String> = row.get(2);
        let version: i64 = row.get(3);

        let level = AlertLevel::from_i16(raw_level)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown alert level {raw_level}")))?;
        let last_sweep = last_sweep
            .map(|s| s.parse::<YearMonth>())
            .transpose()
            .map_err(StoreError::Corrupt)?;

        Ok(Some(Versioned {
            value: AlertState {
                level,
                qualifying_tx_since_last_alert: qualifying.max(0) as u32,
                last_sweep,
            },
            tag: version_tag(version),
        }))
    }

    async fn save_alert_state(
        &self,
        account_id: &str,
        state: &AlertState,
    ) -> Result<ConcurrencyTag, StoreError> {
        let qualifying = i32::try_from(state.qualifying_tx_since_last_alert).unwrap_or(i32::MAX);
        let row = sqlx::query(
            r#"
            INSERT INTO bot_alert_state
                (account_id, level, qualifying_tx, last_sweep_month, version)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (account_id)
            DO UPDATE SET
                level = EXCLUDED.level,
                qualifying_tx = EXCLUDED.qualifying_tx,
                last_sweep_month = EXCLUDED.last_sweep_month,
                version = bot_alert_state.version + 1,
                updated_at = NOW()
            RETURNING version
            "#,
        )
        .bind(account_id)
        .bind(state.level.as_i16())
        .bind(qualifying)
        .bind(state.last_sweep.map(|ym| ym.to_string()))
        .fetch_one(&self.pool)
        .await?;

        Ok(version_tag(row.get(0)))
    }
}

#[async_trait]
impl DedupeStore for PgStore {
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        // Insert, or take over an expired marker; a live marker makes the
        // conditional update match nothing and RETURNING yields no row.
        let row = sqlx::query(
            r#"
            INSERT INTO bot_seen_transactions (transaction_id, seen_at, expires_at)
            VALUES ($1, NOW(), NOW() + make_interval(secs => $2))
            ON CONFLICT (transaction_id) DO UPDATE SET
                seen_at = EXCLUDED.seen_at,
                expires_at = EXCLUDED.expires_at
            WHERE bot_seen_transactions.expires_at <= NOW()
            RETURNING transaction_id
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let affected = sqlx::query("DELETE FROM bot_seen_transactions WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}
