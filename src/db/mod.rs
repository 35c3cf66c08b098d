//! Durable store.
//!
//! One contract, two backends: an in-memory map store for tests and small
//! deployments, and PostgreSQL for production. Writes are idempotent under
//! event replay; the SQL backend additionally guarantees the write is
//! durable before the call returns.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Batch, BatchStatus, Order, OrderStatus, Pair, Trade, User};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Record counts reported by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHealth {
    pub users: u64,
    pub orders: u64,
    pub trades: u64,
    pub batches: u64,
}

/// Store backend selected at startup.
pub enum Store {
    Memory(MemoryStore),
    Postgres(PgStore),
}

impl Store {
    pub fn in_memory() -> Self {
        Store::Memory(MemoryStore::new())
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Store::Postgres(PgStore::connect(database_url).await?))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Postgres(_) => "postgres",
        }
    }

    pub async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => {
                s.save_user(user);
                Ok(())
            }
            Store::Postgres(s) => s.save_user(user).await,
        }
    }

    pub async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => {
                s.save_order(order);
                Ok(())
            }
            Store::Postgres(s) => s.save_order(order).await,
        }
    }

    pub async fn update_order(
        &self,
        id: &str,
        status: OrderStatus,
        filled: Decimal,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => s.update_order(id, status, filled),
            Store::Postgres(s) => s.update_order(id, status, filled).await,
        }
    }

    pub async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => {
                s.save_trade(trade);
                Ok(())
            }
            Store::Postgres(s) => s.save_trade(trade).await,
        }
    }

    pub async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => {
                s.create_batch(batch);
                Ok(())
            }
            Store::Postgres(s) => s.create_batch(batch).await,
        }
    }

    pub async fn attach_trade_to_batch(
        &self,
        trade_id: Uuid,
        batch_id: Uuid,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => s.attach_trade_to_batch(trade_id, batch_id),
            Store::Postgres(s) => s.attach_trade_to_batch(trade_id, batch_id).await,
        }
    }

    pub async fn update_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        tx_hash: Option<&str>,
        at: i64,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(s) => s.update_batch(id, status, tx_hash, at),
            Store::Postgres(s) => s.update_batch(id, status, tx_hash, at).await,
        }
    }

    pub async fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.get_order(id)),
            Store::Postgres(s) => s.get_order(id).await,
        }
    }

    pub async fn orders_by_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Order>, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.orders_by_user(user_id, limit, offset)),
            Store::Postgres(s) => s.orders_by_user(user_id, limit, offset).await,
        }
    }

    pub async fn orders_by_pair(&self, pair: &Pair) -> Result<Vec<Order>, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.orders_by_pair(pair)),
            Store::Postgres(s) => s.orders_by_pair(pair).await,
        }
    }

    pub async fn trades(&self, pair: Option<&Pair>, limit: usize) -> Result<Vec<Trade>, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.trades(pair, limit)),
            Store::Postgres(s) => s.trades(pair, limit).await,
        }
    }

    pub async fn trades_by_user(&self, user_id: &str) -> Result<Vec<Trade>, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.trades_by_user(user_id)),
            Store::Postgres(s) => s.trades_by_user(user_id).await,
        }
    }

    pub async fn pending_batches(&self) -> Result<Vec<Batch>, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.pending_batches()),
            Store::Postgres(s) => s.pending_batches().await,
        }
    }

    pub async fn health(&self) -> Result<StoreHealth, StoreError> {
        match self {
            Store::Memory(s) => Ok(s.health()),
            Store::Postgres(s) => s.health().await,
        }
    }
}
