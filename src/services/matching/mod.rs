//! Order matching.
//!
//! # Architecture
//!
//! ```text
//! transport ingress (parallel)
//!   ↓  bounded mpsc per market
//! Exchange ──routes──► market runner task
//!                        └→ MarketEngine (critical section)
//!                             ├→ OrderBook (price-time priority)
//!                             └→ EventBus (seq'd events)
//!                                  ├→ persistence worker → Store → BatchBuilder
//!                                  └→ MarketBroadcaster → subscribers
//! ```
//!
//! Matching is price-time priority at the maker's price. Determinism: a
//! given sequence of admitted operations yields a byte-identical event
//! stream per market.

mod engine;
mod orchestrator;
mod orderbook;
mod types;

pub use engine::{EngineSettings, MarketEngine};
pub use orchestrator::{Exchange, ExchangeConfig};
pub use orderbook::{LevelSlot, OrderBook, PriceLevel};
pub use types::*;
