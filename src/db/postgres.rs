//! PostgreSQL store backend.
//!
//! Every write is acknowledged by the database before the call returns, and
//! every write is an upsert keyed by the record id so replaying an event
//! stream is idempotent. Schema lives in `migrations/001_init.sql`.

use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    Batch, BatchStatus, CancelReason, Order, OrderStatus, OrderType, Pair, Side, Trade, User,
};

use super::{StoreError, StoreHealth};

type OrderRow = (
    String,          // id
    String,          // user_id
    String,          // pair
    String,          // side
    String,          // order_type
    Option<Decimal>, // price
    Decimal,         // amount
    Decimal,         // filled
    String,          // status
    Option<String>,  // cancel_reason
    i64,             // created_at
    i64,             // nonce
    String,          // signature
    i64,             // chain_id
    Option<i64>,     // expires_at
);

type TradeRow = (
    Uuid,
    String,
    String,
    String,
    String,
    Decimal,
    Decimal,
    Decimal,
    i64,
    Option<Uuid>,
    i64,
);

type BatchRow = (
    Uuid,
    String,
    i64,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Vec<Uuid>,
);

const SELECT_ORDER: &str = "SELECT id, user_id, pair, side, order_type, price, amount, filled, \
     status, cancel_reason, created_at, nonce, signature, chain_id, expires_at FROM orders";

const SELECT_TRADE: &str = "SELECT id, taker_order_id, maker_order_id, pair, side, price, \
     amount, fee, created_at, batch_id, chain_id FROM trades";

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn order_from_row(row: OrderRow) -> Result<Order, StoreError> {
    let (
        id,
        user_id,
        pair,
        side,
        order_type,
        price,
        amount,
        filled,
        status,
        cancel_reason,
        created_at,
        nonce,
        signature,
        chain_id,
        expires_at,
    ) = row;
    Ok(Order {
        id,
        user_id,
        pair: pair.parse::<Pair>().map_err(|e| corrupt("pair", e))?,
        side: side.parse::<Side>().map_err(|e| corrupt("side", e))?,
        order_type: order_type
            .parse::<OrderType>()
            .map_err(|e| corrupt("order_type", e))?,
        price,
        amount,
        filled,
        status: status
            .parse::<OrderStatus>()
            .map_err(|e| corrupt("status", e))?,
        cancel_reason: match cancel_reason.as_deref() {
            None => None,
            Some("user_request") => Some(CancelReason::UserRequest),
            Some("unfilled_market") => Some(CancelReason::UnfilledMarket),
            Some(other) => return Err(corrupt("cancel_reason", other)),
        },
        timestamp: created_at,
        nonce,
        signature,
        chain_id,
        expires_at,
    })
}

fn trade_from_row(row: TradeRow) -> Result<Trade, StoreError> {
    let (id, taker_order_id, maker_order_id, pair, side, price, amount, fee, created_at, batch_id, chain_id) =
        row;
    Ok(Trade {
        id,
        taker_order_id,
        maker_order_id,
        pair: pair.parse::<Pair>().map_err(|e| corrupt("pair", e))?,
        side: side.parse::<Side>().map_err(|e| corrupt("side", e))?,
        price,
        amount,
        fee,
        timestamp: created_at,
        batch_id,
        chain_id,
    })
}

fn cancel_reason_str(reason: Option<CancelReason>) -> Option<&'static str> {
    reason.map(|r| match r {
        CancelReason::UserRequest => "user_request",
        CancelReason::UnfilledMarket => "unfilled_market",
    })
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        info!("postgres store connected");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, nonce, active, created_at, last_activity)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                nonce = GREATEST(users.nonce, EXCLUDED.nonce),
                last_activity = GREATEST(users.last_activity, EXCLUDED.last_activity)
            "#,
        )
        .bind(&user.id)
        .bind(user.nonce)
        .bind(user.active)
        .bind(user.created_at)
        .bind(user.last_activity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, pair, side, order_type, price, amount, filled,
                                status, cancel_reason, created_at, nonce, signature, chain_id,
                                expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                filled = EXCLUDED.filled,
                cancel_reason = EXCLUDED.cancel_reason
            "#,
        )
        .bind(&order.id)
        .bind(&order.user_id)
        .bind(order.pair.canonical())
        .bind(order.side.to_string())
        .bind(order.order_type.to_string())
        .bind(order.price)
        .bind(order.amount)
        .bind(order.filled)
        .bind(order.status.to_string())
        .bind(cancel_reason_str(order.cancel_reason))
        .bind(order.timestamp)
        .bind(order.nonce)
        .bind(&order.signature)
        .bind(order.chain_id)
        .bind(order.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_order(
        &self,
        id: &str,
        status: OrderStatus,
        filled: Decimal,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orders SET status = $2, filled = $3 WHERE id = $1")
            .bind(id)
            .bind(status.to_string())
            .bind(filled)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, taker_order_id, maker_order_id, pair, side, price, amount,
                                fee, created_at, batch_id, chain_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(&trade.taker_order_id)
        .bind(&trade.maker_order_id)
        .bind(trade.pair.canonical())
        .bind(trade.side.to_string())
        .bind(trade.price)
        .bind(trade.amount)
        .bind(trade.fee)
        .bind(trade.timestamp)
        .bind(trade.batch_id)
        .bind(trade.chain_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batches (id, status, created_at, submitted_at, confirmed_at, failed_at,
                                 tx_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(batch.id)
        .bind(batch.status.to_string())
        .bind(batch.created_at)
        .bind(batch.submitted_at)
        .bind(batch.confirmed_at)
        .bind(batch.failed_at)
        .bind(&batch.tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn attach_trade_to_batch(
        &self,
        trade_id: Uuid,
        batch_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO batch_trades (batch_id, trade_id)
            VALUES ($1, $2)
            ON CONFLICT (batch_id, trade_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE trades SET batch_id = $2 WHERE id = $1")
            .bind(trade_id)
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        tx_hash: Option<&str>,
        at: i64,
    ) -> Result<(), StoreError> {
        let query = match status {
            BatchStatus::Pending => {
                "UPDATE batches SET status = $2, tx_hash = COALESCE($3, tx_hash) WHERE id = $1"
            }
            BatchStatus::Submitted => {
                "UPDATE batches SET status = $2, tx_hash = COALESCE($3, tx_hash), \
                 submitted_at = $4 WHERE id = $1"
            }
            BatchStatus::Confirmed => {
                "UPDATE batches SET status = $2, tx_hash = COALESCE($3, tx_hash), \
                 confirmed_at = $4 WHERE id = $1"
            }
            BatchStatus::Failed => {
                "UPDATE batches SET status = $2, tx_hash = COALESCE($3, tx_hash), \
                 failed_at = $4 WHERE id = $1"
            }
        };
        let mut q = sqlx::query(query)
            .bind(id)
            .bind(status.to_string())
            .bind(tx_hash);
        if status != BatchStatus::Pending {
            q = q.bind(at);
        }
        let result = q.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(order_from_row).transpose()
    }

    pub async fn orders_by_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "{SELECT_ORDER} WHERE user_id = $1 ORDER BY created_at DESC, id LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    pub async fn orders_by_pair(&self, pair: &Pair) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "{SELECT_ORDER} WHERE pair = $1 ORDER BY created_at DESC, id"
        ))
        .bind(pair.canonical())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    pub async fn trades(&self, pair: Option<&Pair>, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let rows: Vec<TradeRow> = match pair {
            Some(pair) => {
                sqlx::query_as(&format!(
                    "{SELECT_TRADE} WHERE pair = $1 ORDER BY created_at DESC, id LIMIT $2"
                ))
                .bind(pair.canonical())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "{SELECT_TRADE} ORDER BY created_at DESC, id LIMIT $1"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(trade_from_row).collect()
    }

    pub async fn trades_by_user(&self, user_id: &str) -> Result<Vec<Trade>, StoreError> {
        let rows: Vec<TradeRow> = sqlx::query_as(
            r#"
            SELECT t.id, t.taker_order_id, t.maker_order_id, t.pair, t.side, t.price, t.amount,
                   t.fee, t.created_at, t.batch_id, t.chain_id
            FROM trades t
            JOIN orders tk ON tk.id = t.taker_order_id
            JOIN orders mk ON mk.id = t.maker_order_id
            WHERE tk.user_id = $1 OR mk.user_id = $1
            ORDER BY t.created_at DESC, t.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(trade_from_row).collect()
    }

    pub async fn pending_batches(&self) -> Result<Vec<Batch>, StoreError> {
        let rows: Vec<BatchRow> = sqlx::query_as(
            r#"
            SELECT b.id, b.status, b.created_at, b.submitted_at, b.confirmed_at, b.failed_at,
                   b.tx_hash,
                   COALESCE(ARRAY_AGG(bt.trade_id) FILTER (WHERE bt.trade_id IS NOT NULL), '{}')
            FROM batches b
            LEFT JOIN batch_trades bt ON bt.batch_id = b.id
            WHERE b.status = 'pending'
            GROUP BY b.id
            ORDER BY b.created_at, b.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let (id, status, created_at, submitted_at, confirmed_at, failed_at, tx_hash, trade_ids) =
                    row;
                Ok(Batch {
                    id,
                    trade_ids,
                    status: status
                        .parse::<BatchStatus>()
                        .map_err(|e| corrupt("batch status", e))?,
                    created_at,
                    submitted_at,
                    confirmed_at,
                    failed_at,
                    tx_hash,
                })
            })
            .collect()
    }

    pub async fn health(&self) -> Result<StoreHealth, StoreError> {
        let (users, orders, trades, batches): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM users),
                   (SELECT COUNT(*) FROM orders),
                   (SELECT COUNT(*) FROM trades),
                   (SELECT COUNT(*) FROM batches)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreHealth {
            users: users as u64,
            orders: orders as u64,
            trades: trades as u64,
            batches: batches as u64,
        })
    }
}
