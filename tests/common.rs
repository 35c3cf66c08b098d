//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use fake::faker::number::en::NumberWithFormat;
use fake::Fake;
use tokio::task::JoinHandle;

use clob_core::db::Store;
use clob_core::events::{BusMessage, EventKind, EventStream};
use clob_core::services::health::HealthMonitor;
use clob_core::services::matching::{EngineSettings, Exchange, ExchangeConfig};
use clob_core::services::persistence::spawn_persistence_worker;
use clob_core::{OrderIntent, OrderType, Pair, Side};

pub fn eth_usdc() -> Pair {
    Pair::new("ETH", "USDC")
}

pub fn btc_usdc() -> Pair {
    Pair::new("BTC", "USDC")
}

/// A fully wired core on the in-memory store.
pub struct TestCore {
    pub exchange: Arc<Exchange>,
    pub store: Arc<Store>,
    pub monitor: HealthMonitor,
    pub workers: Vec<JoinHandle<()>>,
}

impl TestCore {
    pub fn start() -> Self {
        let (monitor, health_rx) = HealthMonitor::channel();
        let exchange = Arc::new(Exchange::new(
            ExchangeConfig {
                pairs: vec![eth_usdc(), btc_usdc()],
                bus_capacity: 1024,
                ingress_queue_depth: 256,
                engine: EngineSettings::default(),
            },
            health_rx,
        ));
        let store = Arc::new(Store::in_memory());

        let mut workers = Vec::new();
        for pair in exchange.pairs() {
            let stream = exchange.subscribe(&pair).unwrap();
            workers.push(spawn_persistence_worker(
                store.clone(),
                pair,
                stream,
                monitor.clone(),
                None,
            ));
        }

        Self {
            exchange,
            store,
            monitor,
            workers,
        }
    }

    /// Drop the exchange and wait for the persistence workers to drain, so
    /// store assertions observe every event.
    pub async fn settle(self) -> Arc<Store> {
        drop(self.exchange);
        for worker in self.workers {
            worker.await.unwrap();
        }
        self.store
    }
}

pub fn random_address() -> String {
    format!("0x{}", NumberWithFormat("^###############").fake::<String>())
}

pub fn limit_intent(
    id: &str,
    user: &str,
    pair: Pair,
    side: Side,
    price: &str,
    amount: &str,
    ts: i64,
) -> OrderIntent {
    OrderIntent {
        id: id.to_string(),
        user_id: user.to_string(),
        pair,
        side,
        order_type: OrderType::Limit,
        price: Some(price.to_string()),
        amount: amount.to_string(),
        timestamp: ts,
        nonce: ts,
        signature: format!("0xsig-{id}"),
        chain_id: 8453,
        expires_at: None,
    }
}

pub fn market_intent(
    id: &str,
    user: &str,
    pair: Pair,
    side: Side,
    amount: &str,
    ts: i64,
) -> OrderIntent {
    OrderIntent {
        order_type: OrderType::Market,
        price: None,
        ..limit_intent(id, user, pair, side, "0", amount, ts)
    }
}

/// Compact rendering of an event stream for exact-sequence assertions.
pub fn drain_events(stream: &mut EventStream) -> Vec<String> {
    let mut rendered = Vec::new();
    while let Some(message) = stream.try_next() {
        match message {
            BusMessage::Event(event) => rendered.push(render_event(&event.event)),
            BusMessage::Lagged { dropped } => rendered.push(format!("lagged:{dropped}")),
        }
    }
    rendered
}

pub fn render_event(event: &EventKind) -> String {
    match event {
        EventKind::OrderAdded { order } => format!("added:{}:{}", order.id, order.status),
        EventKind::OrderUpdated { order } => {
            format!("updated:{}:{}:{}", order.id, order.status, order.filled)
        }
        EventKind::OrderCancelled { order } => format!("cancelled:{}", order.id),
        EventKind::OrderExpired { order } => format!("expired:{}", order.id),
        EventKind::TradeExecuted { trade } => format!(
            "trade:{}>{}@{}x{}",
            trade.taker_order_id, trade.maker_order_id, trade.price, trade.amount
        ),
        EventKind::BookUpdated { book } => {
            format!("book:{}b/{}a", book.bids.len(), book.asks.len())
        }
    }
}
