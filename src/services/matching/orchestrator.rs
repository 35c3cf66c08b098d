//! Market orchestration.
//!
//! One engine task per market: ingress from any number of transport threads
//! funnels into a bounded FIFO command queue, and the runner applies one
//! operation at a time against the book, so matching is a critical section
//! without locks. The `Exchange` routes operations to the right market and
//! enforces global order-id uniqueness across markets.

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::events::{EventBus, EventStream};
use crate::models::{CancelIntent, Order, OrderIntent, Pair};
use crate::services::health::EngineHealth;

use super::engine::{EngineSettings, MarketEngine};
use super::types::{BookSnapshot, EngineError, InvalidOrderKind, PlaceResult};

enum EngineCommand {
    Place {
        intent: OrderIntent,
        reply: oneshot::Sender<Result<PlaceResult, EngineError>>,
    },
    Cancel {
        intent: CancelIntent,
        reply: oneshot::Sender<Result<Order, EngineError>>,
    },
    ExpireDue {
        now: i64,
        reply: oneshot::Sender<Vec<Order>>,
    },
    Snapshot {
        depth: usize,
        reply: oneshot::Sender<BookSnapshot>,
    },
}

struct MarketHandle {
    pair: Pair,
    commands: mpsc::Sender<EngineCommand>,
    bus: EventBus,
}

/// Exchange construction knobs.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub pairs: Vec<Pair>,
    pub bus_capacity: usize,
    pub ingress_queue_depth: usize,
    pub engine: EngineSettings,
}

/// Multi-market facade over the per-market engine tasks.
///
/// Must be created inside a tokio runtime; the runner tasks stop when the
/// `Exchange` is dropped and the command queues close.
pub struct Exchange {
    markets: DashMap<String, MarketHandle>,
    /// order id -> canonical pair, for routing cancels
    order_locations: DashMap<String, String>,
}

impl Exchange {
    pub fn new(config: ExchangeConfig, health: watch::Receiver<EngineHealth>) -> Self {
        let markets = DashMap::new();
        for pair in config.pairs {
            let bus = EventBus::new(config.bus_capacity);
            let (tx, rx) = mpsc::channel(config.ingress_queue_depth);
            let engine = MarketEngine::new(
                pair.clone(),
                config.engine.clone(),
                bus.clone(),
                health.clone(),
            );
            tokio::spawn(run_market(engine, rx));
            markets.insert(
                pair.canonical(),
                MarketHandle {
                    pair,
                    commands: tx,
                    bus,
                },
            );
        }
        info!(markets = markets.len(), "exchange initialized");
        Self {
            markets,
            order_locations: DashMap::new(),
        }
    }

    pub fn pairs(&self) -> Vec<Pair> {
        let mut pairs: Vec<Pair> = self.markets.iter().map(|m| m.pair.clone()).collect();
        pairs.sort_by_key(|p| p.canonical());
        pairs
    }

    /// Event stream for one market, from now on.
    pub fn subscribe(&self, pair: &Pair) -> Option<EventStream> {
        self.markets
            .get(&pair.canonical())
            .map(|m| m.bus.subscribe())
    }

    fn commands_for(&self, key: &str) -> Result<mpsc::Sender<EngineCommand>, EngineError> {
        self.markets
            .get(key)
            .map(|m| m.commands.clone())
            .ok_or_else(|| match key.parse::<Pair>() {
                Ok(pair) => EngineError::UnknownMarket(pair),
                Err(_) => EngineError::NotFound(key.to_string()),
            })
    }

    /// Admit a new order into its market's queue and wait for the outcome.
    pub async fn place(&self, intent: OrderIntent) -> Result<PlaceResult, EngineError> {
        let key = intent.pair.canonical();
        let commands = self.commands_for(&key)?;

        match self.order_locations.entry(intent.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::InvalidOrder(InvalidOrderKind::DuplicateId));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }
        let order_id = intent.id.clone();

        let (reply, rx) = oneshot::channel();
        let result = async {
            commands
                .send(EngineCommand::Place { intent, reply })
                .await
                .map_err(|_| EngineError::Shutdown)?;
            rx.await.map_err(|_| EngineError::Shutdown)?
        }
        .await;

        if result.is_err() {
            self.order_locations.remove(&order_id);
        }
        result
    }

    /// Cancel by order id; the intent carries no pair, so routing uses the
    /// exchange-wide order index.
    pub async fn cancel(&self, intent: CancelIntent) -> Result<Order, EngineError> {
        let key = self
            .order_locations
            .get(&intent.order_id)
            .map(|loc| loc.clone())
            .ok_or_else(|| EngineError::NotFound(intent.order_id.clone()))?;
        let commands = self.commands_for(&key)?;

        let (reply, rx) = oneshot::channel();
        commands
            .send(EngineCommand::Cancel { intent, reply })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Expire due orders on every market. Markets are swept in canonical
    /// pair order.
    pub async fn expire_due(&self, now: i64) -> Vec<Order> {
        let mut handles: Vec<(String, mpsc::Sender<EngineCommand>)> = self
            .markets
            .iter()
            .map(|m| (m.key().clone(), m.commands.clone()))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));

        let mut expired = Vec::new();
        for (key, commands) in handles {
            let (reply, rx) = oneshot::channel();
            if commands
                .send(EngineCommand::ExpireDue { now, reply })
                .await
                .is_err()
            {
                warn!(market = %key, "expiry sweep skipped, runner gone");
                continue;
            }
            if let Ok(mut orders) = rx.await {
                expired.append(&mut orders);
            }
        }
        expired
    }

    /// Live book snapshot for one market.
    pub async fn snapshot(&self, pair: &Pair, depth: usize) -> Result<BookSnapshot, EngineError> {
        let commands = self.commands_for(&pair.canonical())?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(EngineCommand::Snapshot { depth, reply })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }
}

async fn run_market(mut engine: MarketEngine, mut commands: mpsc::Receiver<EngineCommand>) {
    info!(pair = %engine.pair(), "market runner started");
    while let Some(command) = commands.recv().await {
        match command {
            EngineCommand::Place { intent, reply } => {
                let _ = reply.send(engine.place(intent));
            }
            EngineCommand::Cancel { intent, reply } => {
                let _ = reply.send(engine.cancel(&intent));
            }
            EngineCommand::ExpireDue { now, reply } => {
                let _ = reply.send(engine.expire_due(now));
            }
            EngineCommand::Snapshot { depth, reply } => {
                let _ = reply.send(engine.snapshot(depth));
            }
        }
    }
    info!(pair = %engine.pair(), "market runner stopped");
}
