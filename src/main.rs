//! M-Pesa+ ledger service entry point
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │ HTTP API │──▶│ LedgerEngine │──▶│  Gateway  │
//! └──────────┘   └──────────────┘   └───────────┘
//!      │                ▲                 │
//!      │ webhook        │ apply_callback  │ callback
//!      ▼                │                 ▼
//! ┌──────────────────────────┐      ┌───────────┐
//! │ CallbackQueue → Worker   │◀─────│  Provider │
//! └──────────────────────────┘      └───────────┘
//!            ExpirySweeper (PENDING SLA, stale recovery)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mpesa_ledger::api::{self, AppState, auth::JwtVerifier};
use mpesa_ledger::catalog::PlanCatalog;
use mpesa_ledger::config::{AppConfig, GatewayProvider};
use mpesa_ledger::gateway::{CallbackVerifier, DarajaGateway, PaymentGateway, SimulatedGateway};
use mpesa_ledger::ledger::{
    CallbackWorker, ExpirySweeper, LedgerEngine, LedgerStore, MemoryLedgerStore, PgLedgerStore,
    callback_channel,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PgLedgerStore::connect(url, config.database.max_connections)
                .await
                .context("failed to open ledger database")?;
            tracing::info!("Using PostgreSQL ledger store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database.url configured, records are kept in memory only");
            Ok(Arc::new(MemoryLedgerStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = mpesa_ledger::logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting M-Pesa+ ledger"
    );

    let store = open_store(&app_config).await?;
    let (callbacks, callback_rx) = callback_channel(app_config.server.callback_queue_size);
    let verifier = CallbackVerifier::new(app_config.gateway.callback_secret.as_bytes());

    let gateway: Arc<dyn PaymentGateway> = match app_config.gateway.provider {
        GatewayProvider::Simulated => {
            let simulated = SimulatedGateway::new(verifier);
            match app_config.gateway.auto_settle_ms {
                Some(ms) => Arc::new(
                    simulated.with_auto_settle(Duration::from_millis(ms), callbacks.clone()),
                ),
                None => Arc::new(simulated),
            }
        }
        GatewayProvider::Daraja => Arc::new(
            DarajaGateway::new(app_config.gateway.daraja.clone(), verifier)
                .context("failed to build Daraja client")?,
        ),
    };
    tracing::info!(gateway = gateway.name(), "Payment gateway ready");

    let engine = Arc::new(LedgerEngine::new(
        store,
        gateway,
        Arc::new(PlanCatalog::standard()),
        app_config.engine.to_engine_config(),
    ));

    let worker = CallbackWorker::new(engine.clone(), callback_rx);
    tokio::spawn(async move {
        worker.run().await;
    });

    if app_config.sweeper.enabled {
        let sweeper = ExpirySweeper::new(engine.clone(), app_config.sweeper.to_sweeper_config());
        tokio::spawn(async move {
            sweeper.run().await;
        });
    } else {
        tracing::warn!("Expiry sweeper disabled, PENDING records will not time out");
    }

    let state = Arc::new(AppState::new(
        engine,
        callbacks,
        JwtVerifier::new(&app_config.auth.jwt_secret),
    ));

    let port = get_port_override().unwrap_or(app_config.server.port);
    api::run_server(
        &app_config.server.host,
        port,
        state,
        app_config.server.body_limit_bytes,
    )
    .await
}
