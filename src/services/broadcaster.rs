//! Market data broadcaster.
//!
//! Fans engine events out to transport-facing subscribers: per-pair order
//! book and trade channels plus per-user order channels. Every subscriber
//! owns a bounded queue; a slow book subscriber is resynced with a fresh
//! snapshot instead of blocking the pump, and a closed one is dropped. The
//! engine is never blocked by a subscriber.
//!
//! Delivery ordering follows engine emission order per pair. Cross-pair
//! ordering is not guaranteed. Heartbeats carry the latest seq so
//! subscribers can detect gaps.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::{BusMessage, EventKind};
use crate::metrics;
use crate::models::{Order, Pair, Side, Trade};
use crate::services::matching::{BookSnapshot, EngineError, Exchange, LevelView};

/// Pseudo-pair key for subscribers of every market's trades.
const ALL_PAIRS: &str = "*";

/// One changed book level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelDelta {
    pub side: Side,
    pub price: Decimal,
    /// Zero when the level vanished
    pub new_aggregate: Decimal,
    pub new_order_count: usize,
}

/// Wire messages delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    OrderbookSnapshot {
        pair: Pair,
        bids: Vec<LevelView>,
        asks: Vec<LevelView>,
        last_update: i64,
        seq: u64,
    },
    OrderbookUpdate {
        pair: Pair,
        changes: Vec<LevelDelta>,
        seq: u64,
    },
    TradeExecuted {
        trade: Trade,
        seq: u64,
    },
    OrderFilled {
        order: Order,
        seq: u64,
    },
    OrderCancelled {
        order: Order,
        seq: u64,
    },
    Heartbeat {
        seq: u64,
        ts: i64,
    },
}

/// A live subscription: keep the receiver, use the id to unsubscribe.
pub struct Subscription {
    pub id: u64,
    pub messages: mpsc::Receiver<SubscriberMessage>,
}

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub snapshot_depth: usize,
    pub subscriber_queue_depth: usize,
    pub heartbeat_interval: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            snapshot_depth: 20,
            subscriber_queue_depth: 256,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

struct Sink {
    id: u64,
    tx: mpsc::Sender<SubscriberMessage>,
    /// Set when the sink's queue overflowed and it must be resynced with a
    /// snapshot before it may receive deltas again
    needs_snapshot: AtomicBool,
}

#[derive(Default)]
struct Registry {
    book_subs: DashMap<String, Vec<Sink>>,
    trade_subs: DashMap<String, Vec<Sink>>,
    user_subs: DashMap<String, Vec<Sink>>,
    last_seq: DashMap<String, AtomicU64>,
    next_id: AtomicU64,
}

impl Registry {
    fn new_sink(&self, depth: usize) -> (Sink, Subscription) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(depth);
        (
            Sink {
                id,
                tx,
                needs_snapshot: AtomicBool::new(false),
            },
            Subscription { id, messages: rx },
        )
    }

    fn seq_of(&self, key: &str) -> u64 {
        self.last_seq
            .get(key)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn record_seq(&self, key: &str, seq: u64) {
        self.last_seq
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(seq, Ordering::Relaxed);
    }

    /// Best-effort fanout: a full queue drops the message, a closed one
    /// drops the subscriber.
    fn send_to(subs: &DashMap<String, Vec<Sink>>, key: &str, message: &SubscriberMessage) {
        let Some(mut sinks) = subs.get_mut(key) else {
            return;
        };
        sinks.retain(|sink| match sink.tx.try_send(message.clone()) {
            Ok(()) => {
                metrics::record_subscriber_message();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                sink.needs_snapshot.store(true, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Subscriber-facing side of the market data pipeline.
#[derive(Clone)]
pub struct MarketBroadcaster {
    exchange: Arc<Exchange>,
    registry: Arc<Registry>,
    config: BroadcasterConfig,
}

impl MarketBroadcaster {
    pub fn new(exchange: Arc<Exchange>, config: BroadcasterConfig) -> Self {
        Self {
            exchange,
            registry: Arc::new(Registry::default()),
            config,
        }
    }

    /// Spawn one pump task per market currently known to the exchange.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.exchange
            .pairs()
            .into_iter()
            .map(|pair| self.spawn_pump(pair))
            .collect()
    }

    fn spawn_pump(&self, pair: Pair) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move { broadcaster.pump(pair).await })
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Book channel: an immediate snapshot of the live book, then deltas.
    pub async fn subscribe_orderbook(&self, pair: &Pair) -> Result<Subscription, EngineError> {
        let snapshot = self
            .exchange
            .snapshot(pair, self.config.snapshot_depth)
            .await?;
        let key = pair.canonical();
        let (sink, subscription) = self.registry.new_sink(self.config.subscriber_queue_depth);
        let _ = sink.tx.try_send(SubscriberMessage::OrderbookSnapshot {
            pair: pair.clone(),
            bids: snapshot.bids,
            asks: snapshot.asks,
            last_update: snapshot.last_update,
            seq: self.registry.seq_of(&key),
        });
        self.registry.book_subs.entry(key).or_default().push(sink);
        Ok(subscription)
    }

    pub fn unsubscribe_orderbook(&self, pair: &Pair, id: u64) {
        if let Some(mut sinks) = self.registry.book_subs.get_mut(&pair.canonical()) {
            sinks.retain(|s| s.id != id);
        }
    }

    /// Trade channel for one pair, or for every pair when `pair` is `None`.
    pub fn subscribe_trades(&self, pair: Option<&Pair>) -> Subscription {
        let key = pair.map_or_else(|| ALL_PAIRS.to_string(), |p| p.canonical());
        let (sink, subscription) = self.registry.new_sink(self.config.subscriber_queue_depth);
        self.registry.trade_subs.entry(key).or_default().push(sink);
        subscription
    }

    pub fn unsubscribe_trades(&self, pair: Option<&Pair>, id: u64) {
        let key = pair.map_or_else(|| ALL_PAIRS.to_string(), |p| p.canonical());
        if let Some(mut sinks) = self.registry.trade_subs.get_mut(&key) {
            sinks.retain(|s| s.id != id);
        }
    }

    /// Per-user order updates. The transport layer is responsible for
    /// authorizing the asserted `user_id` before calling this.
    pub fn subscribe_user_orders(&self, user_id: &str) -> Subscription {
        let (sink, subscription) = self.registry.new_sink(self.config.subscriber_queue_depth);
        self.registry
            .user_subs
            .entry(user_id.to_string())
            .or_default()
            .push(sink);
        subscription
    }

    pub fn unsubscribe_user_orders(&self, user_id: &str, id: u64) {
        if let Some(mut sinks) = self.registry.user_subs.get_mut(user_id) {
            sinks.retain(|s| s.id != id);
        }
    }

    // ========================================================================
    // Event pump
    // ========================================================================

    async fn pump(&self, pair: Pair) {
        let Some(mut stream) = self.exchange.subscribe(&pair) else {
            warn!(pair = %pair, "no such market, broadcaster pump not started");
            return;
        };
        let key = pair.canonical();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_snapshot: Option<BookSnapshot> = None;

        info!(pair = %pair, "broadcaster pump started");
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    None => break,
                    Some(BusMessage::Lagged { dropped }) => {
                        warn!(pair = %pair, dropped, "broadcaster lagged, resyncing subscribers");
                        if let Ok(snapshot) = self
                            .exchange
                            .snapshot(&pair, self.config.snapshot_depth)
                            .await
                        {
                            self.send_snapshot_to_all(&key, &pair, &snapshot);
                            last_snapshot = Some(snapshot);
                        }
                    }
                    Some(BusMessage::Event(event)) => {
                        self.registry.record_seq(&key, event.seq);
                        self.handle_event(&key, &pair, event.seq, event.event, &mut last_snapshot);
                    }
                },
                _ = heartbeat.tick() => {
                    let message = SubscriberMessage::Heartbeat {
                        seq: self.registry.seq_of(&key),
                        ts: chrono::Utc::now().timestamp_millis(),
                    };
                    Registry::send_to(&self.registry.book_subs, &key, &message);
                    Registry::send_to(&self.registry.trade_subs, &key, &message);
                    Registry::send_to(&self.registry.trade_subs, ALL_PAIRS, &message);
                }
            }
        }
        info!(pair = %pair, "broadcaster pump stopped");
    }

    fn handle_event(
        &self,
        key: &str,
        pair: &Pair,
        seq: u64,
        event: EventKind,
        last_snapshot: &mut Option<BookSnapshot>,
    ) {
        match event {
            EventKind::BookUpdated { book } => {
                self.publish_book(key, pair, seq, &book, last_snapshot.as_ref());
                *last_snapshot = Some(book);
            }
            EventKind::TradeExecuted { trade } => {
                let message = SubscriberMessage::TradeExecuted { trade, seq };
                Registry::send_to(&self.registry.trade_subs, key, &message);
                Registry::send_to(&self.registry.trade_subs, ALL_PAIRS, &message);
            }
            EventKind::OrderUpdated { order } => {
                if order.filled > Decimal::ZERO {
                    let user = order.user_id.clone();
                    let message = SubscriberMessage::OrderFilled { order, seq };
                    Registry::send_to(&self.registry.user_subs, &user, &message);
                }
            }
            EventKind::OrderCancelled { order } | EventKind::OrderExpired { order } => {
                let user = order.user_id.clone();
                let message = SubscriberMessage::OrderCancelled { order, seq };
                Registry::send_to(&self.registry.user_subs, &user, &message);
            }
            // resting placements surface through the next book snapshot
            EventKind::OrderAdded { .. } => {}
        }
    }

    fn publish_book(
        &self,
        key: &str,
        pair: &Pair,
        seq: u64,
        book: &BookSnapshot,
        previous: Option<&BookSnapshot>,
    ) {
        let changes = match previous {
            Some(previous) => diff_snapshots(previous, book),
            None => {
                self.send_snapshot_to_all(key, pair, book);
                return;
            }
        };

        let Some(mut sinks) = self.registry.book_subs.get_mut(key) else {
            return;
        };
        sinks.retain(|sink| {
            let message = if sink.needs_snapshot.swap(false, Ordering::Relaxed) {
                SubscriberMessage::OrderbookSnapshot {
                    pair: pair.clone(),
                    bids: book.bids.clone(),
                    asks: book.asks.clone(),
                    last_update: book.last_update,
                    seq,
                }
            } else if changes.is_empty() {
                return true;
            } else {
                SubscriberMessage::OrderbookUpdate {
                    pair: pair.clone(),
                    changes: changes.clone(),
                    seq,
                }
            };
            match sink.tx.try_send(message) {
                Ok(()) => {
                    metrics::record_subscriber_message();
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sink.needs_snapshot.store(true, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn send_snapshot_to_all(&self, key: &str, pair: &Pair, book: &BookSnapshot) {
        let message = SubscriberMessage::OrderbookSnapshot {
            pair: pair.clone(),
            bids: book.bids.clone(),
            asks: book.asks.clone(),
            last_update: book.last_update,
            seq: self.registry.seq_of(key),
        };
        Registry::send_to(&self.registry.book_subs, key, &message);
        if let Some(sinks) = self.registry.book_subs.get(key) {
            for sink in sinks.iter() {
                sink.needs_snapshot.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Levels whose aggregate changed between two snapshots, including levels
/// that vanished (aggregate zero).
fn diff_snapshots(previous: &BookSnapshot, next: &BookSnapshot) -> Vec<LevelDelta> {
    let mut changes = Vec::new();
    for (side, old_levels, new_levels) in [
        (Side::Buy, &previous.bids, &next.bids),
        (Side::Sell, &previous.asks, &next.asks),
    ] {
        for level in new_levels {
            let before = old_levels.iter().find(|l| l.price == level.price);
            if before.map_or(true, |b| {
                b.amount != level.amount || b.order_count != level.order_count
            }) {
                changes.push(LevelDelta {
                    side,
                    price: level.price,
                    new_aggregate: level.amount,
                    new_order_count: level.order_count,
                });
            }
        }
        for level in old_levels {
            if !new_levels.iter().any(|l| l.price == level.price) {
                changes.push(LevelDelta {
                    side,
                    price: level.price,
                    new_aggregate: Decimal::ZERO,
                    new_order_count: 0,
                });
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, amount: Decimal, count: usize) -> LevelView {
        LevelView {
            price,
            amount,
            order_count: count,
        }
    }

    fn snapshot(bids: Vec<LevelView>, asks: Vec<LevelView>) -> BookSnapshot {
        BookSnapshot {
            pair: Pair::new("ETH", "USDC"),
            bids,
            asks,
            last_update: 1,
        }
    }

    #[test]
    fn test_diff_reports_changed_levels() {
        let before = snapshot(
            vec![level(dec!(2000), dec!(2), 2), level(dec!(1999), dec!(1), 1)],
            vec![level(dec!(2001), dec!(1), 1)],
        );
        let after = snapshot(
            vec![level(dec!(2000), dec!(1.5), 1), level(dec!(1999), dec!(1), 1)],
            vec![level(dec!(2001), dec!(1), 1)],
        );

        let changes = diff_snapshots(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].side, Side::Buy);
        assert_eq!(changes[0].price, dec!(2000));
        assert_eq!(changes[0].new_aggregate, dec!(1.5));
        assert_eq!(changes[0].new_order_count, 1);
    }

    #[test]
    fn test_diff_reports_vanished_level_as_zero() {
        let before = snapshot(vec![level(dec!(2000), dec!(1), 1)], vec![]);
        let after = snapshot(vec![], vec![]);

        let changes = diff_snapshots(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_aggregate, Decimal::ZERO);
        assert_eq!(changes[0].new_order_count, 0);
    }

    #[test]
    fn test_diff_reports_new_level() {
        let before = snapshot(vec![], vec![]);
        let after = snapshot(vec![], vec![level(dec!(2001), dec!(0.5), 1)]);

        let changes = diff_snapshots(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].side, Side::Sell);
        assert_eq!(changes[0].new_aggregate, dec!(0.5));
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let snap = snapshot(vec![level(dec!(2000), dec!(1), 1)], vec![]);
        assert!(diff_snapshots(&snap, &snap).is_empty());
    }
}
