//! In-memory store backend.
//!
//! Same contract as the SQL backend, minus crash durability. Used by tests
//! and single-node deployments.

use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Batch, BatchStatus, Order, OrderStatus, Pair, Trade, User};

use super::{StoreError, StoreHealth};

#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    orders: DashMap<String, Order>,
    trades: DashMap<Uuid, Trade>,
    batches: DashMap<Uuid, Batch>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_user(&self, user: &User) {
        self.users
            .entry(user.id.clone())
            .and_modify(|existing| existing.touch(user.nonce, user.last_activity))
            .or_insert_with(|| user.clone());
    }

    pub fn save_order(&self, order: &Order) {
        self.orders.insert(order.id.clone(), order.clone());
    }

    pub fn update_order(
        &self,
        id: &str,
        status: OrderStatus,
        filled: Decimal,
    ) -> Result<(), StoreError> {
        let mut order = self
            .orders
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        order.status = status;
        order.filled = filled;
        Ok(())
    }

    pub fn save_trade(&self, trade: &Trade) {
        self.trades.entry(trade.id).or_insert_with(|| trade.clone());
    }

    pub fn create_batch(&self, batch: &Batch) {
        self.batches.entry(batch.id).or_insert_with(|| batch.clone());
    }

    pub fn attach_trade_to_batch(&self, trade_id: Uuid, batch_id: Uuid) -> Result<(), StoreError> {
        let mut trade = self
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| StoreError::NotFound(trade_id.to_string()))?;
        trade.batch_id = Some(batch_id);

        let mut batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;
        if !batch.trade_ids.contains(&trade_id) {
            batch.trade_ids.push(trade_id);
        }
        Ok(())
    }

    pub fn update_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        tx_hash: Option<&str>,
        at: i64,
    ) -> Result<(), StoreError> {
        let mut batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        batch.status = status;
        if let Some(hash) = tx_hash {
            batch.tx_hash = Some(hash.to_string());
        }
        match status {
            BatchStatus::Pending => {}
            BatchStatus::Submitted => batch.submitted_at = Some(at),
            BatchStatus::Confirmed => batch.confirmed_at = Some(at),
            BatchStatus::Failed => batch.failed_at = Some(at),
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_order(&self, id: &str) -> Option<Order> {
        self.orders.get(id).map(|o| o.clone())
    }

    pub fn orders_by_user(&self, user_id: &str, limit: usize, offset: usize) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.user_id == user_id)
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        orders.into_iter().skip(offset).take(limit).collect()
    }

    pub fn orders_by_pair(&self, pair: &Pair) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| &o.pair == pair)
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        orders
    }

    pub fn trades(&self, pair: Option<&Pair>, limit: usize) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| pair.map_or(true, |p| &t.pair == p))
            .map(|t| t.clone())
            .collect();
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        trades.truncate(limit);
        trades
    }

    pub fn trades_by_user(&self, user_id: &str) -> Vec<Trade> {
        let owns = |order_id: &str| {
            self.orders
                .get(order_id)
                .is_some_and(|o| o.user_id == user_id)
        };
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| owns(&t.taker_order_id) || owns(&t.maker_order_id))
            .map(|t| t.clone())
            .collect();
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        trades
    }

    pub fn pending_batches(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Pending)
            .map(|b| b.clone())
            .collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        batches
    }

    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            users: self.users.len() as u64,
            orders: self.orders.len() as u64,
            trades: self.trades.len() as u64,
            batches: self.batches.len() as u64,
        }
    }
}
