//! Hybrid DEX CLOB core.
//!
//! Deterministic central-limit-order-book matching with an event-sourced
//! persistence and market-data pipeline. The transport layer (REST/WS),
//! authentication and the on-chain settlement adapter live outside this
//! crate and talk to it through intents, subscriptions and the settlement
//! channel.
//!
//! ```text
//! transport ingress
//!   ↓ OrderIntent / CancelIntent
//! Exchange (router) ─► per-market engine task
//!                        ├─ OrderBook        price-time priority
//!                        └─ EventBus         seq'd market events
//!                             ├─ persistence worker ─► Store (memory | postgres)
//!                             │      └─ committed trades ─► BatchBuilder ─► settlement adapter
//!                             └─ MarketBroadcaster  ─► subscribers
//! ```

pub mod config;
pub mod db;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::AppConfig;
pub use db::{Store, StoreError, StoreHealth};
pub use events::{BusMessage, EventBus, EventKind, EventStream, MarketEvent};
pub use models::{
    Batch, BatchStatus, CancelIntent, CancelReason, Order, OrderIntent, OrderStatus, OrderType,
    Pair, Side, Trade, User,
};
pub use services::batching::{BatchBuilder, BatchConfig};
pub use services::broadcaster::{
    BroadcasterConfig, LevelDelta, MarketBroadcaster, SubscriberMessage, Subscription,
};
pub use services::health::{EngineHealth, HealthMonitor};
pub use services::matching::{
    BookSnapshot, EngineError, EngineSettings, Exchange, ExchangeConfig, FeePolicy,
    InvalidOrderKind, LevelView, MarketEngine, OrderBook, PlaceResult,
};
pub use services::settlement::{
    settlement_channel, SettlementAdapter, SettlementCommand, SettlementLink, SettlementReport,
};
