use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use monzo_balance_bot::alert::{AlertPolicy, AlertService};
use monzo_balance_bot::config::StateBackend;
use monzo_balance_bot::crypto::CryptoEngine;
use monzo_balance_bot::monzo::{MonzoApi, MonzoClient};
use monzo_balance_bot::store::{
    self, AlertStateStore, DedupeStore, MemoryStore, PgStore, TokenStore,
};
use monzo_balance_bot::token::TokenService;
use monzo_balance_bot::webhooks::WebhookService;
use monzo_balance_bot::{api, AppState, Config, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monzo_balance_bot=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("monzo-balance-bot v{}", env!("CARGO_PKG_VERSION"));
    info!("Monitoring account {}", config.account_id);

    // State backend
    let (tokens_store, alert_store, dedupe): (
        Arc<dyn TokenStore>,
        Arc<dyn AlertStateStore>,
        Arc<dyn DedupeStore>,
    ) = match config.state_backend {
        StateBackend::Memory => {
            tracing::warn!("Using in-memory state; tokens and alert state are lost on restart");
            let store = Arc::new(MemoryStore::new());
            backends(store)
        }
        StateBackend::Postgres => {
            let master_key = config
                .master_key
                .as_deref()
                .context("MASTER_KEY is required for the postgres backend")?;
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let crypto = CryptoEngine::new(master_key)?;
            let store = Arc::new(PgStore::new(database_url, crypto).await?);
            store.migrate().await?;
            info!("Database connected and migrated ✓");
            backends(store)
        }
    };

    let monzo: Arc<dyn MonzoApi> = Arc::new(MonzoClient::new(
        &config.monzo_api_base,
        config.client_id.clone(),
        config.client_secret.clone(),
        config.connect_timeout,
        config.request_timeout,
    )?);

    let tokens = Arc::new(TokenService::new(tokens_store, monzo.clone(), &config));
    let alerts = AlertService::new(AlertPolicy::from_config(&config));
    let webhooks = WebhookService::new(
        &config,
        tokens.clone(),
        monzo,
        alerts,
        alert_store,
        dedupe.clone(),
    );

    // Start keepalive daemon
    if config.keepalive_interval.is_zero() {
        info!("Token keepalive disabled");
    } else {
        let interval = config.keepalive_interval;
        tokio::spawn(async move {
            store::keepalive_daemon(tokens, dedupe, interval).await;
        });
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state: SharedState = Arc::new(AppState { config, webhooks });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr} ✓");
    axum::serve(listener, app).await?;

    Ok(())
}

fn backends<S>(store: Arc<S>) -> (Arc<dyn TokenStore>, Arc<dyn AlertStateStore>, Arc<dyn DedupeStore>)
where
    S: TokenStore + AlertStateStore + DedupeStore + 'static,
{
    let tokens: Arc<dyn TokenStore> = store.clone();
    let alerts: Arc<dyn AlertStateStore> = store.clone();
    let dedupe: Arc<dyn DedupeStore> = store;
    (tokens, alerts, dedupe)
}
