//! Per-market matching engine.
//!
//! One `MarketEngine` owns one market: its book, its order arena, its user
//! table and its event bus. Every public operation runs as a CPU-bound
//! critical section and publishes the resulting events in the exact order
//! the state changes were applied, each stamped with the next sequence
//! number. Given the same sequence of `place`/`cancel`/`expire_due` calls
//! the engine produces a byte-identical event stream: all timestamps come
//! from ingress, and trade ids are derived from `(pair, seq)`.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::events::{EventBus, EventKind, MarketEvent};
use crate::metrics;
use crate::models::decimal::{self, DecimalError};
use crate::models::{
    CancelIntent, CancelReason, Order, OrderIntent, OrderStatus, OrderType, Pair, Side, Trade,
    User,
};
use crate::services::health::EngineHealth;

use super::orderbook::OrderBook;
use super::types::{
    BookSnapshot, EngineError, FeePolicy, InvalidOrderKind, PlaceResult, PriceKey,
};

/// Largest admissible order amount. Together with the price-key range this
/// keeps every fill's quote notional inside `Decimal`'s 96-bit mantissa.
const MAX_AMOUNT: i64 = 1_000_000_000_000_000;

/// Namespace for deterministic trade ids.
const TRADE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8a93_70fd_41c2_4ce0_9d1f_6b5a_22e4_c917);

/// Per-market tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub snapshot_depth: usize,
    pub price_scale: u32,
    pub fee: FeePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            snapshot_depth: 20,
            price_scale: crate::models::PRICE_SCALE,
            fee: FeePolicy::default(),
        }
    }
}

pub struct MarketEngine {
    pair: Pair,
    book: OrderBook,
    /// Every order ever admitted to this market, keyed by id
    orders: HashMap<String, Order>,
    users: HashMap<String, User>,
    settings: EngineSettings,
    bus: EventBus,
    seq: u64,
    /// Highest ingress timestamp seen; used where an operation carries none
    clock: i64,
    health: watch::Receiver<EngineHealth>,
}

impl MarketEngine {
    pub fn new(
        pair: Pair,
        settings: EngineSettings,
        bus: EventBus,
        health: watch::Receiver<EngineHealth>,
    ) -> Self {
        Self {
            book: OrderBook::new(pair.clone()),
            pair,
            orders: HashMap::new(),
            users: HashMap::new(),
            settings,
            bus,
            seq: 0,
            clock: 0,
            health,
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn order(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        self.book.snapshot(depth)
    }

    fn emit(&mut self, event: EventKind) {
        self.seq += 1;
        self.bus.publish(MarketEvent {
            seq: self.seq,
            event,
        });
    }

    fn next_trade_id(&self) -> Uuid {
        let name = format!("{}:{}", self.pair, self.seq + 1);
        Uuid::new_v5(&TRADE_ID_NAMESPACE, name.as_bytes())
    }

    // ========================================================================
    // Admission
    // ========================================================================

    fn parse_amount(&self, raw: &str) -> Result<Decimal, EngineError> {
        let amount = decimal::parse_amount(raw).map_err(|e| {
            EngineError::InvalidOrder(match e {
                DecimalError::NonPositive(_) => InvalidOrderKind::NonPositiveAmount,
                DecimalError::ExcessScale { .. } => InvalidOrderKind::AmountPrecision,
                _ => InvalidOrderKind::MalformedAmount,
            })
        })?;
        if amount > Decimal::from(MAX_AMOUNT) {
            return Err(EngineError::InvalidOrder(InvalidOrderKind::AmountOutOfRange));
        }
        Ok(amount)
    }

    fn parse_limit_price(&self, raw: Option<&str>) -> Result<Decimal, EngineError> {
        let raw = raw.ok_or(EngineError::InvalidOrder(InvalidOrderKind::MissingPrice))?;
        let price = decimal::parse_price(raw, self.settings.price_scale).map_err(|e| {
            EngineError::InvalidOrder(match e {
                DecimalError::NonPositive(_) => InvalidOrderKind::NonPositivePrice,
                DecimalError::ExcessScale { .. } => InvalidOrderKind::PricePrecision,
                _ => InvalidOrderKind::MalformedPrice,
            })
        })?;
        PriceKey::try_from_decimal(price)
            .map_err(|_| EngineError::InvalidOrder(InvalidOrderKind::PriceOutOfRange))?;
        Ok(price)
    }

    fn admit(&mut self, intent: &OrderIntent) -> Result<Order, EngineError> {
        if intent.pair != self.pair {
            return Err(EngineError::InvalidOrder(InvalidOrderKind::WrongMarket));
        }
        if intent.id.is_empty() {
            return Err(EngineError::InvalidOrder(InvalidOrderKind::EmptyId));
        }
        if self.orders.contains_key(&intent.id) {
            return Err(EngineError::InvalidOrder(InvalidOrderKind::DuplicateId));
        }

        let amount = self.parse_amount(&intent.amount)?;
        let price = match intent.order_type {
            OrderType::Limit => Some(self.parse_limit_price(intent.price.as_deref())?),
            // Market orders cross unconditionally; any supplied price is ignored
            OrderType::Market => None,
        };

        if let Some(expires_at) = intent.expires_at {
            if expires_at <= intent.timestamp {
                return Err(EngineError::Expired(intent.id.clone()));
            }
        }

        self.users
            .entry(intent.user_id.clone())
            .or_insert_with(|| User::new(intent.user_id.clone(), intent.timestamp))
            .touch(intent.nonce, intent.timestamp);

        Ok(Order {
            id: intent.id.clone(),
            user_id: intent.user_id.clone(),
            pair: intent.pair.clone(),
            side: intent.side,
            order_type: intent.order_type,
            price,
            amount,
            filled: Decimal::ZERO,
            status: OrderStatus::Pending,
            cancel_reason: None,
            timestamp: intent.timestamp,
            nonce: intent.nonce,
            signature: intent.signature.clone(),
            chain_id: intent.chain_id,
            expires_at: intent.expires_at,
        })
    }

    // ========================================================================
    // Matching
    // ========================================================================

    fn crosses(taker: &Order, level_price: Decimal) -> bool {
        match taker.order_type {
            OrderType::Market => true,
            OrderType::Limit => match (taker.side, taker.price) {
                (Side::Buy, Some(limit)) => limit >= level_price,
                (Side::Sell, Some(limit)) => limit <= level_price,
                _ => false,
            },
        }
    }

    /// Walk the opposite book while the taker crosses, filling FIFO at the
    /// maker's price. Events for each step are published immediately.
    fn match_taker(&mut self, taker: &mut Order) -> Vec<Trade> {
        let opposite = taker.side.opposite();
        let mut trades = Vec::new();

        while taker.remaining() > Decimal::ZERO {
            let Some((maker_id, level_price)) = self.book.top(opposite).and_then(|level| {
                level
                    .head()
                    .map(|slot| (slot.order_id.clone(), level.price))
            }) else {
                break;
            };
            if !Self::crosses(taker, level_price) {
                break;
            }

            let trade_id = self.next_trade_id();
            let fee_policy = self.settings.fee.clone();
            let chain_id = taker.chain_id;
            let taker_side = taker.side;
            let taker_ts = taker.timestamp;
            let taker_id = taker.id.clone();
            let taker_remaining = taker.remaining();

            let Some(maker) = self.orders.get_mut(&maker_id) else {
                error!(order_id = %maker_id, "book slot without arena record");
                break;
            };

            let trade_amount = taker_remaining.min(maker.remaining());
            let fee = match fee_policy.trade_fee(level_price, trade_amount) {
                Ok(fee) => fee,
                Err(e) => {
                    // unreachable with admission-bounded inputs
                    error!(error = %e, "fee computation failed, recording zero fee");
                    Decimal::ZERO
                }
            };

            maker.filled += trade_amount;
            let maker_filled = maker.remaining() == Decimal::ZERO;
            maker.status = if maker_filled {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };
            let maker_snapshot = maker.clone();

            taker.filled += trade_amount;

            let trade = Trade {
                id: trade_id,
                taker_order_id: taker_id,
                maker_order_id: maker_id,
                pair: self.pair.clone(),
                side: taker_side,
                price: level_price,
                amount: trade_amount,
                fee,
                timestamp: taker_ts,
                batch_id: None,
                chain_id,
            };

            self.book
                .fill_head(opposite, trade_amount, maker_filled, taker_ts);
            self.emit(EventKind::TradeExecuted {
                trade: trade.clone(),
            });
            self.emit(EventKind::OrderUpdated {
                order: maker_snapshot,
            });
            metrics::record_trade_executed(&self.pair.canonical(), trade.notional());
            trades.push(trade);
        }

        trades
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Admit and match a new order. On success the order has been fully
    /// processed: matched, rested (limit) or cancelled (market remainder).
    #[instrument(skip(self, intent), fields(pair = %self.pair, order_id = %intent.id))]
    pub fn place(&mut self, intent: OrderIntent) -> Result<PlaceResult, EngineError> {
        if self.health.borrow().degraded() {
            return Err(EngineError::StoreUnavailable);
        }

        let mut taker = self.admit(&intent)?;
        if intent.timestamp > self.clock {
            self.clock = intent.timestamp;
        }
        metrics::record_order_placed(&intent.side.to_string(), &intent.order_type.to_string());
        let match_timer = metrics::Timer::new();

        self.emit(EventKind::OrderAdded {
            order: taker.clone(),
        });

        let trades = self.match_taker(&mut taker);

        if taker.remaining() == Decimal::ZERO {
            taker.status = OrderStatus::Filled;
            self.emit(EventKind::OrderUpdated {
                order: taker.clone(),
            });
        } else {
            match taker.order_type {
                OrderType::Limit => {
                    taker.status = if taker.filled == Decimal::ZERO {
                        OrderStatus::Pending
                    } else {
                        OrderStatus::Partial
                    };
                    if let Err(e) = self.book.insert(&taker) {
                        error!(order_id = %taker.id, error = %e, "failed to rest admitted order");
                    }
                    if !trades.is_empty() {
                        self.emit(EventKind::OrderUpdated {
                            order: taker.clone(),
                        });
                    }
                }
                OrderType::Market => {
                    if !trades.is_empty() {
                        taker.status = OrderStatus::Partial;
                        self.emit(EventKind::OrderUpdated {
                            order: taker.clone(),
                        });
                    }
                    taker.status = OrderStatus::Cancelled;
                    taker.cancel_reason = Some(CancelReason::UnfilledMarket);
                    self.emit(EventKind::OrderCancelled {
                        order: taker.clone(),
                    });
                }
            }
        }

        if !trades.is_empty() {
            self.emit(EventKind::BookUpdated {
                book: self.book.snapshot(self.settings.snapshot_depth),
            });
        }

        metrics::record_match_duration(match_timer.elapsed_secs());
        debug!(
            status = %taker.status,
            filled = %taker.filled,
            trades = trades.len(),
            "order processed"
        );
        self.orders.insert(taker.id.clone(), taker.clone());
        Ok(PlaceResult {
            order: taker,
            trades,
        })
    }

    /// Cancel a resting order on behalf of its owner.
    #[instrument(skip(self, intent), fields(pair = %self.pair, order_id = %intent.order_id))]
    pub fn cancel(&mut self, intent: &CancelIntent) -> Result<Order, EngineError> {
        let order = self
            .orders
            .get(&intent.order_id)
            .ok_or_else(|| EngineError::NotFound(intent.order_id.clone()))?;
        if order.user_id != intent.requester_id {
            return Err(EngineError::NotOwner {
                order_id: intent.order_id.clone(),
                requester_id: intent.requester_id.clone(),
            });
        }
        if order.is_terminal() {
            return Err(EngineError::NotCancellable(intent.order_id.clone()));
        }

        let now = self.clock;
        let resting = order.clone();
        self.book.remove(&resting, now)?;

        let order = self
            .orders
            .get_mut(&intent.order_id)
            .ok_or_else(|| EngineError::NotFound(intent.order_id.clone()))?;
        order.status = OrderStatus::Cancelled;
        order.cancel_reason = Some(CancelReason::UserRequest);
        let cancelled = order.clone();

        self.emit(EventKind::OrderCancelled {
            order: cancelled.clone(),
        });
        self.emit(EventKind::BookUpdated {
            book: self.book.snapshot(self.settings.snapshot_depth),
        });
        metrics::record_order_cancelled();
        Ok(cancelled)
    }

    /// Expire every resting order whose `expires_at` has passed. Invoked on
    /// a timer by the service wiring; there is no background sweeper inside
    /// the engine.
    #[instrument(skip(self), fields(pair = %self.pair))]
    pub fn expire_due(&mut self, now: i64) -> Vec<Order> {
        if now > self.clock {
            self.clock = now;
        }

        let mut due: Vec<(i64, String)> = self
            .orders
            .values()
            .filter(|o| o.is_resting() && o.expires_at.is_some_and(|exp| exp <= now))
            .map(|o| (o.timestamp, o.id.clone()))
            .collect();
        due.sort();

        let mut expired = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(order) = self.orders.get(&id).cloned() else {
                continue;
            };
            if self.book.remove(&order, now).is_err() {
                continue;
            }
            let Some(order) = self.orders.get_mut(&id) else {
                continue;
            };
            order.status = OrderStatus::Expired;
            let snapshot = order.clone();
            self.emit(EventKind::OrderExpired {
                order: snapshot.clone(),
            });
            metrics::record_order_expired();
            expired.push(snapshot);
        }

        if !expired.is_empty() {
            self.emit(EventKind::BookUpdated {
                book: self.book.snapshot(self.settings.snapshot_depth),
            });
        }
        expired
    }
}
