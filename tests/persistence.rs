mod common;

use crate::common::*;
use std::sync::Arc;
use std::time::Duration;

use clob_core::db::Store;
use clob_core::services::batching::{BatchBuilder, BatchConfig};
use clob_core::services::matching::OrderBook;
use clob_core::services::settlement::{settlement_channel, spawn_auto_confirm_adapter};
use clob_core::{OrderStatus, Side};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_event_stream_is_fully_persisted() {
    let core = TestCore::start();

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "2", 1))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("s1", "U2", eth_usdc(), Side::Sell, "2000", "0.5", 2))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("x1", "U1", btc_usdc(), Side::Buy, "60000", "1", 3))
        .await
        .unwrap();

    let store = core.settle().await;

    let health = store.health().await.unwrap();
    assert_eq!(health.users, 2);
    assert_eq!(health.orders, 3);
    assert_eq!(health.trades, 1);

    let b1 = store.get_order("b1").await.unwrap().unwrap();
    assert_eq!(b1.status, OrderStatus::Partial);
    assert_eq!(b1.filled, dec!(0.5));

    let eth_trades = store.trades(Some(&eth_usdc()), 10).await.unwrap();
    assert_eq!(eth_trades.len(), 1);
    assert_eq!(eth_trades[0].price, dec!(2000));
    assert_eq!(eth_trades[0].fee, dec!(0.5));
    assert!(store.trades(Some(&btc_usdc()), 10).await.unwrap().is_empty());

    let u1_orders = store.orders_by_user("U1", 10, 0).await.unwrap();
    assert_eq!(u1_orders.len(), 2);
    assert_eq!(store.orders_by_pair(&eth_usdc()).await.unwrap().len(), 2);
    assert_eq!(store.trades_by_user("U2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rebuilding_book_from_persisted_orders_matches_live() {
    let core = TestCore::start();

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "1999", "2", 1))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("b2", "U2", eth_usdc(), Side::Buy, "2000", "1", 2))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("a1", "U3", eth_usdc(), Side::Sell, "2001", "1.5", 3))
        .await
        .unwrap();
    // partially consume the best bid so a resting order carries fills
    core.exchange
        .place(limit_intent("s1", "U3", eth_usdc(), Side::Sell, "2000", "0.4", 4))
        .await
        .unwrap();

    let live = core.exchange.snapshot(&eth_usdc(), 50).await.unwrap();
    let store = core.settle().await;

    let mut rebuilt = OrderBook::new(eth_usdc());
    let mut resting: Vec<_> = store
        .orders_by_pair(&eth_usdc())
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.is_resting())
        .collect();
    resting.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    for order in &resting {
        rebuilt.insert(order).unwrap();
    }

    let replayed = rebuilt.snapshot(50);
    assert_eq!(replayed.bids, live.bids);
    assert_eq!(replayed.asks, live.asks);
}

#[tokio::test]
async fn test_trades_flow_into_confirmed_batches() {
    // full pipeline wired by hand: engines -> persistence (committed trades)
    // -> batch builder -> auto-confirm adapter
    let (monitor, health_rx) = clob_core::services::health::HealthMonitor::channel();
    let exchange = Arc::new(clob_core::services::matching::Exchange::new(
        clob_core::services::matching::ExchangeConfig {
            pairs: vec![eth_usdc()],
            bus_capacity: 256,
            ingress_queue_depth: 64,
            engine: clob_core::services::matching::EngineSettings::default(),
        },
        health_rx,
    ));
    let store = Arc::new(Store::in_memory());

    let (link, adapter) = settlement_channel(32);
    let (trade_tx, trade_rx) = tokio::sync::mpsc::channel(32);
    clob_core::services::persistence::spawn_persistence_worker(
        store.clone(),
        eth_usdc(),
        exchange.subscribe(&eth_usdc()).unwrap(),
        monitor.clone(),
        Some(trade_tx),
    );
    BatchBuilder::new(
        store.clone(),
        BatchConfig {
            max_trades: 2,
            max_wait: Duration::from_millis(50),
            ..BatchConfig::default()
        },
        monitor.clone(),
    )
    .spawn(trade_rx, link);
    spawn_auto_confirm_adapter(adapter);

    exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();
    exchange
        .place(limit_intent("s1", "U2", eth_usdc(), Side::Sell, "2000", "1", 2))
        .await
        .unwrap();

    let batched = wait_for(&store, |trades| {
        !trades.is_empty() && trades.iter().all(|t| t.batch_id.is_some())
    })
    .await;
    assert_eq!(batched.len(), 1);
    assert!(store.pending_batches().await.unwrap().is_empty());
}

async fn wait_for(
    store: &Arc<Store>,
    ready: impl Fn(&[clob_core::Trade]) -> bool,
) -> Vec<clob_core::Trade> {
    for _ in 0..100 {
        let trades = store.trades(None, 100).await.unwrap();
        if ready(&trades) {
            return trades;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within timeout");
}
