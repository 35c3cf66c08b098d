use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clob_core::config::AppConfig;
use clob_core::db::Store;
use clob_core::services::batching::BatchBuilder;
use clob_core::services::broadcaster::MarketBroadcaster;
use clob_core::services::health::HealthMonitor;
use clob_core::services::matching::Exchange;
use clob_core::services::persistence::spawn_persistence_worker;
use clob_core::services::settlement::{settlement_channel, spawn_auto_confirm_adapter};
use clob_core::metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clob_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting CLOB core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    let _metrics_handle = metrics::init_metrics();

    // Durable store
    let store = match config.store_backend.as_str() {
        "memory" => Store::in_memory(),
        "postgres" => Store::connect(&config.database_url).await?,
        other => anyhow::bail!("unknown store backend: {other}"),
    };
    let counts = store.health().await?;
    tracing::info!(
        backend = store.backend_name(),
        users = counts.users,
        orders = counts.orders,
        trades = counts.trades,
        batches = counts.batches,
        "store ready"
    );
    let store = Arc::new(store);

    // Health channel: persistence failures flip the engine into the
    // degraded, fail-closed state
    let (monitor, health_rx) = HealthMonitor::channel();
    let mut degraded_watch = health_rx.clone();
    tokio::spawn(async move {
        loop {
            let health = *degraded_watch.borrow_and_update();
            metrics::set_engine_degraded(health.degraded());
            if health.degraded() {
                tracing::warn!(?health, "engine degraded, rejecting new orders");
            }
            if degraded_watch.changed().await.is_err() {
                break;
            }
        }
    });

    // Matching engines, one runner task per configured market
    let pairs = config.trading_pairs()?;
    let exchange = Arc::new(Exchange::new(config.exchange_config()?, health_rx));
    tracing::info!("Matching engines initialized for {:?}", pairs);

    // Per-market persistence workers; committed trades flow on to batching
    let (trade_tx, trade_rx) = tokio::sync::mpsc::channel(config.settlement_queue_depth);
    for pair in &pairs {
        let stream = exchange
            .subscribe(pair)
            .expect("configured market must exist");
        spawn_persistence_worker(
            store.clone(),
            pair.clone(),
            stream,
            monitor.clone(),
            Some(trade_tx.clone()),
        );
    }
    drop(trade_tx);
    tracing::info!("Persistence workers spawned");

    // Market data broadcaster
    let broadcaster = MarketBroadcaster::new(exchange.clone(), config.broadcaster_config());
    broadcaster.start();
    tracing::info!("Market broadcaster started");

    // Batch builder and settlement channel
    let (link, adapter) = settlement_channel(config.settlement_queue_depth);
    BatchBuilder::new(store.clone(), config.batch_config(), monitor.clone()).spawn(trade_rx, link);
    tracing::info!("Batch builder started");

    if config.auto_settlement {
        spawn_auto_confirm_adapter(adapter);
        tracing::info!("Auto-confirm settlement adapter enabled (dev mode)");
    } else {
        // a real settlement integration takes over this channel; until then
        // drain submissions so the builder is never blocked
        let mut adapter = adapter;
        tokio::spawn(async move {
            while let Some(command) = adapter.commands.recv().await {
                tracing::warn!(?command, "no settlement adapter attached, batch left pending");
            }
        });
    }

    // Lazy expiry sweep: expires_at is only evaluated here
    let sweep_exchange = exchange.clone();
    let sweep_interval = std::time::Duration::from_millis(config.expiry_sweep_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let expired = sweep_exchange.expire_due(now).await;
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), "expired due orders");
            }
        }
    });
    tracing::info!("Expiry sweeper started ({}ms)", config.expiry_sweep_interval_ms);

    tracing::info!("CLOB core running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
