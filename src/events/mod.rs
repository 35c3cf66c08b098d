//! Typed in-process event bus.
//!
//! One bus per market. The engine is the single producer; the persistence
//! worker and the broadcaster each hold their own receiver. Queues are
//! bounded: a consumer that falls behind loses its oldest events and sees a
//! `Lagged` marker instead, so it can decide how to resync.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Order, Trade};
use crate::services::matching::BookSnapshot;

/// Engine state change, in the exact order the engine applied it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    OrderAdded { order: Order },
    OrderUpdated { order: Order },
    OrderCancelled { order: Order },
    OrderExpired { order: Order },
    TradeExecuted { trade: Trade },
    BookUpdated { book: BookSnapshot },
}

/// A sequenced event. `seq` starts at 1 and is gap-free per market engine.
#[derive(Debug, Clone, Serialize)]
pub struct MarketEvent {
    pub seq: u64,
    pub event: EventKind,
}

/// What a consumer pulls off its queue.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(MarketEvent),
    /// The consumer's queue overflowed and `dropped` events were discarded.
    Lagged { dropped: u64 },
}

/// Single-producer, multi-consumer fanout for one market.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MarketEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish never blocks and never fails; an event with no subscribers is
    /// simply dropped.
    pub fn publish(&self, event: MarketEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<MarketEvent>,
}

impl EventStream {
    /// Next message, or `None` once the producer is gone and the queue is
    /// drained.
    pub async fn next(&mut self) -> Option<BusMessage> {
        match self.rx.recv().await {
            Ok(event) => Some(BusMessage::Event(event)),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                Some(BusMessage::Lagged { dropped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant used by tests to drain what is already queued.
    pub fn try_next(&mut self) -> Option<BusMessage> {
        match self.rx.try_recv() {
            Ok(event) => Some(BusMessage::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(dropped)) => {
                Some(BusMessage::Lagged { dropped })
            }
            Err(_) => None,
        }
    }
}
