use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::alert::Commitment;

/// Upper bound for the dedupe window. Monzo stops redelivering long before this.
const MAX_SEEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Application configuration, loaded from environment variables.
///
/// Most keys accept a second, legacy spelling (e.g. `MONZOCLIENTID`) so an
/// existing deployment's app settings keep working unchanged.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,

    // ── Monzo OAuth client ──────────────────────────────────────────────
    pub monzo_api_base: String,
    pub client_id: String,
    pub client_secret: String,
    pub account_id: String,
    /// Only used to seed the token store on first run.
    pub fallback_refresh_token: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    // ── Webhook ─────────────────────────────────────────────────────────
    pub webhook_secret: String,
    pub allow_query_secret: bool,
    pub verify_transactions: bool,
    pub seen_ttl: Duration,

    // ── Alerts ──────────────────────────────────────────────────────────
    pub warning_limit: i64,
    pub critical_limit: i64,
    pub alert_frequency: u32,

    // ── Commitment sweep ────────────────────────────────────────────────
    pub sweep_enabled: bool,
    pub sweep_pot_id: Option<String>,
    pub commitments: Vec<Commitment>,

    // ── Token upkeep ────────────────────────────────────────────────────
    pub token_expiry_margin: Duration,
    /// Zero disables the keepalive daemon.
    pub keepalive_interval: Duration,

    // ── State backend ───────────────────────────────────────────────────
    pub state_backend: StateBackend,
    pub database_url: Option<String>,
    /// 32-byte base64-encoded key for encrypting tokens at rest (postgres only).
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    Postgres,
}

impl StateBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StateBackend::Memory => "memory",
            StateBackend::Postgres => "postgres",
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let state_backend = match env_any(&["STATE_BACKEND"])
            .unwrap_or_else(|| "memory".into())
            .to_lowercase()
            .as_str()
        {
            "memory" => StateBackend::Memory,
            "postgres" | "postgresql" => StateBackend::Postgres,
            other => bail!("Unsupported STATE_BACKEND: {other}"),
        };

        let commitments = match env_any(&["COMMITMENTS_FILE"]) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read COMMITMENTS_FILE {path}"))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid commitments JSON in {path}"))?
            }
            None => Vec::new(),
        };

        let config = Config {
            host: env_any(&["HOST"]).unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&["PORT"], 8080).context("Invalid PORT")?,

            monzo_api_base: env_any(&["MONZO_API_BASE"])
                .unwrap_or_else(|| "https://api.monzo.com".into()),
            client_id: required(&["MONZO_CLIENT_ID", "MONZOCLIENTID"])?,
            client_secret: required(&["MONZO_CLIENT_SECRET", "MONZOCLIENTSECRET"])?,
            account_id: required(&["MONZO_ACCOUNT_ID", "MONZOACCOUNTID"])?,
            fallback_refresh_token: required(&["MONZO_REFRESH_TOKEN", "MONZOREFRESHTOKEN"])?,
            request_timeout: Duration::from_secs(
                parse_or(&["REQUEST_TIMEOUT_SECS"], 10).context("Invalid REQUEST_TIMEOUT_SECS")?,
            ),
            connect_timeout: Duration::from_secs(
                parse_or(&["CONNECT_TIMEOUT_SECS"], 3).context("Invalid CONNECT_TIMEOUT_SECS")?,
            ),

            webhook_secret: required(&["WEBHOOK_SECRET", "WEBHOOKSECRET"])?,
            allow_query_secret: flag(&["ALLOW_QUERY_SECRET"], true)?,
            verify_transactions: flag(&["VERIFY_TRANSACTIONS"], true)?,
            seen_ttl: Duration::from_secs(
                parse_or(&["SEEN_TTL_SECS"], 600).context("Invalid SEEN_TTL_SECS")?,
            ),

            warning_limit: parse_or(&["BALANCE_LIMIT_WARNING", "LIMIT_WARNING"], 25_000)
                .context("Invalid BALANCE_LIMIT_WARNING")?,
            critical_limit: parse_or(&["BALANCE_LIMIT_CRITICAL", "LIMIT_CRITICAL"], 10_000)
                .context("Invalid BALANCE_LIMIT_CRITICAL")?,
            alert_frequency: parse_or(&["ALERT_FREQUENCY"], 10).context("Invalid ALERT_FREQUENCY")?,

            sweep_enabled: flag(&["COMMITMENTS_SWEEP_ENABLED"], false)?,
            sweep_pot_id: env_any(&["COMMITMENTS_POT_ID"]),
            commitments,

            token_expiry_margin: Duration::from_secs(
                parse_or(&["TOKEN_EXPIRY_MARGIN_SECS"], 60)
                    .context("Invalid TOKEN_EXPIRY_MARGIN_SECS")?,
            ),
            keepalive_interval: Duration::from_secs(
                parse_or(&["KEEPALIVE_INTERVAL_SECS"], 300)
                    .context("Invalid KEEPALIVE_INTERVAL_SECS")?,
            ),

            state_backend,
            database_url: env_any(&["DATABASE_URL"]),
            master_key: env_any(&["MASTER_KEY"]),
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that individual parsers cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.warning_limit <= self.critical_limit {
            bail!(
                "BALANCE_LIMIT_WARNING ({}) must be greater than BALANCE_LIMIT_CRITICAL ({})",
                self.warning_limit,
                self.critical_limit
            );
        }
        if self.seen_ttl > MAX_SEEN_TTL {
            bail!(
                "SEEN_TTL_SECS ({}) must not exceed {}",
                self.seen_ttl.as_secs(),
                MAX_SEEN_TTL.as_secs()
            );
        }
        if self.alert_frequency == 0 {
            bail!("ALERT_FREQUENCY must be at least 1");
        }
        if self.sweep_enabled && self.sweep_pot_id.is_none() {
            bail!("COMMITMENTS_POT_ID is required when COMMITMENTS_SWEEP_ENABLED is set");
        }
        if self.state_backend == StateBackend::Postgres {
            if self.database_url.is_none() {
                bail!("DATABASE_URL is required for STATE_BACKEND=postgres");
            }
            if self.master_key.is_none() {
                bail!("MASTER_KEY is required for STATE_BACKEND=postgres (32 bytes, base64)");
            }
        }
        Ok(())
    }
}

/// First non-empty value among `keys`.
fn env_any(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.is_empty())
}

fn required(keys: &[&str]) -> Result<String> {
    env_any(keys).with_context(|| format!("{} is required", keys[0]))
}

fn parse_or<T>(keys: &[&str], default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_any(keys) {
        Some(raw) => Ok(raw.trim().parse()?),
        None => Ok(default),
    }
}

fn flag(keys: &[&str], default: bool) -> Result<bool> {
    match env_any(keys) {
        Some(raw) => match parse_flag(&raw) {
            Some(value) => Ok(value),
            None => bail!("Invalid {}: {raw:?} (expected true/false, yes/no, on/off or 1/0)", keys[0]),
        },
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        monzo_api_base: "http://monzo.invalid".into(),
        client_id: "oauth2client_test".into(),
        client_secret: "client-secret".into(),
        account_id: "acc_test".into(),
        fallback_refresh_token: "seed_refresh".into(),
        request_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(3),
        webhook_secret: "webhook_secret".into(),
        allow_query_secret: false,
        verify_transactions: true,
        seen_ttl: Duration::from_secs(600),
        warning_limit: 25_000,
        critical_limit: 10_000,
        alert_frequency: 10,
        sweep_enabled: false,
        sweep_pot_id: None,
        commitments: Vec::new(),
        token_expiry_margin: Duration::from_secs(60),
        keepalive_interval: Duration::ZERO,
        state_backend: StateBackend::Memory,
        database_url: None,
        master_key: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("false"), Some(false));
        assert_eq!(parse_flag(" OFF "), Some(false));
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = test_config();
        config.warning_limit = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_rejects_typos() {
        std::env::set_var("BOT_TEST_FLAG_TYPO", "flase");
        assert!(flag(&["BOT_TEST_FLAG_TYPO"], true).is_err());
        std::env::set_var("BOT_TEST_FLAG_TYPO", "off");
        assert!(!flag(&["BOT_TEST_FLAG_TYPO"], true).unwrap());
        std::env::remove_var("BOT_TEST_FLAG_TYPO");
        assert!(flag(&["BOT_TEST_FLAG_TYPO"], true).unwrap());
    }

    #[test]
    fn test_validate_rejects_huge_seen_ttl() {
        let mut config = test_config();
        config.seen_ttl = Duration::from_secs(u64::MAX / 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let mut config = test_config();
        config.alert_frequency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_pot_for_sweep() {
        let mut config = test_config();
        config.sweep_enabled = true;
        assert!(config.validate().is_err());
        config.sweep_pot_id = Some("pot_reserve".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_database_for_postgres() {
        let mut config = test_config();
        config.state_backend = StateBackend::Postgres;
        assert!(config.validate().is_err());
        config.database_url = Some("postgres://localhost/bot".into());
        config.master_key = Some("a2V5".into());
        assert!(config.validate().is_ok());
    }
}
