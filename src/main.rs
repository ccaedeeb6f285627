//! Application entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use transaction_verifier::api::create_router;
use transaction_verifier::app::{AppState, ChainRouter, spawn_verification_loop};
use transaction_verifier::config::Config;
use transaction_verifier::infra::{CoinCapClient, HeliusClient, PostgresConfig, PostgresStore};
use transaction_verifier::ws::WsHub;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(
        "Transaction verification service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load("./config.yaml").context("Failed to load configuration")?;
    if config.database.url.is_empty() {
        anyhow::bail!("DATABASE_URL not set");
    }

    info!("Initializing infrastructure...");

    let store = PostgresStore::new(
        &config.database.url,
        PostgresConfig {
            max_connections: config.database.max_connections,
            min_connections: config.database.min_connections,
            ..PostgresConfig::default()
        },
    )
    .await
    .context("Failed to connect to database")?;
    store
        .run_migrations()
        .await
        .context("Failed to run migrations")?;
    info!("   Database connected and migrations applied");

    let helius = HeliusClient::new(config.helius_config()).context("Failed to build Helius client")?;
    let exchange =
        CoinCapClient::new(config.exchange_config()).context("Failed to build exchange client")?;
    info!("   Indexer and exchange-rate clients created");

    let (hub_task, hub) = WsHub::spawn();
    info!("   WebSocket hub started");

    let store: Arc<dyn transaction_verifier::domain::LedgerStore> = Arc::new(store);
    let router = ChainRouter::new(Arc::new(helius));
    let (verifier_task, verifier_shutdown) = spawn_verification_loop(
        Arc::clone(&store),
        router,
        Arc::new(exchange),
        Arc::new(hub.clone()),
        config.verification_config(),
    );
    info!("   Verification loop started");

    let state = Arc::new(AppState::new(store, hub));
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Server starting on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the verification loop, then let the hub drain
    let _ = verifier_shutdown.send(true);
    let _ = verifier_task.await;
    drop(hub_task);

    info!("Server shutdown complete");
    Ok(())
}
