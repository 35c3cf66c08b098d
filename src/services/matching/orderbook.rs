//! Per-market order book.
//!
//! Price-time priority: bids descend, asks ascend, FIFO by
//! `(timestamp, order_id)` inside a level. The book is owned exclusively by
//! its market's engine task, so there is no interior locking. Level
//! aggregates are maintained incrementally on every mutation and are never
//! recomputed on the hot path. The book stores order positions only; the
//! engine owns the order records.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::models::{Order, Pair, Side};

use super::types::{BookSnapshot, EngineError, InvalidOrderKind, LevelView, PriceKey};

/// Queue position of one resting order.
#[derive(Debug, Clone)]
pub struct LevelSlot {
    pub order_id: String,
    pub timestamp: i64,
}

/// All resting orders on one side at one price.
#[derive(Debug)]
pub struct PriceLevel {
    pub price: Decimal,
    slots: VecDeque<LevelSlot>,
    /// Sum of remaining amounts of the contained orders
    pub amount: Decimal,
}

impl PriceLevel {
    fn new(price: Decimal) -> Self {
        Self {
            price,
            slots: VecDeque::new(),
            amount: Decimal::ZERO,
        }
    }

    pub fn order_count(&self) -> usize {
        self.slots.len()
    }

    /// Front of the FIFO queue.
    pub fn head(&self) -> Option<&LevelSlot> {
        self.slots.front()
    }

    fn enqueue(&mut self, slot: LevelSlot) {
        // Ingress timestamps are monotonic per market, so this is almost
        // always a push_back; the scan keeps (timestamp, order_id) order for
        // equal-timestamp admissions.
        let pos = self
            .slots
            .iter()
            .rposition(|s| (s.timestamp, s.order_id.as_str()) <= (slot.timestamp, slot.order_id.as_str()));
        match pos {
            Some(i) => self.slots.insert(i + 1, slot),
            None => self.slots.push_front(slot),
        }
    }
}

/// One market's bid and ask ladders.
#[derive(Debug)]
pub struct OrderBook {
    pair: Pair,
    /// Best bid is the greatest key
    bids: BTreeMap<PriceKey, PriceLevel>,
    /// Best ask is the smallest key
    asks: BTreeMap<PriceKey, PriceLevel>,
    /// Order id -> (side, level) for O(1) location on cancel
    index: HashMap<String, (Side, PriceKey)>,
    last_update: i64,
}

impl OrderBook {
    pub fn new(pair: Pair) -> Self {
        Self {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            last_update: 0,
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn last_update(&self) -> i64 {
        self.last_update
    }

    /// Total resting orders across both sides.
    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.index.contains_key(order_id)
    }

    fn ladder(&self, side: Side) -> &BTreeMap<PriceKey, PriceLevel> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn ladder_mut(&mut self, side: Side) -> &mut BTreeMap<PriceKey, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn best_key(&self, side: Side) -> Option<PriceKey> {
        match side {
            Side::Buy => self.bids.keys().next_back().copied(),
            Side::Sell => self.asks.keys().next().copied(),
        }
    }

    fn touch(&mut self, now: i64) {
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Place a resting order into its side's level, creating the level if
    /// absent.
    pub fn insert(&mut self, order: &Order) -> Result<(), EngineError> {
        if order.remaining() <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder(InvalidOrderKind::NonPositiveAmount));
        }
        if self.index.contains_key(&order.id) {
            return Err(EngineError::InvalidOrder(InvalidOrderKind::DuplicateId));
        }
        let price = order
            .price
            .ok_or(EngineError::InvalidOrder(InvalidOrderKind::MissingPrice))?;
        let key = PriceKey::try_from_decimal(price)
            .map_err(|_| EngineError::InvalidOrder(InvalidOrderKind::PriceOutOfRange))?;

        let remaining = order.remaining();
        let level = self
            .ladder_mut(order.side)
            .entry(key)
            .or_insert_with(|| PriceLevel::new(price));
        level.enqueue(LevelSlot {
            order_id: order.id.clone(),
            timestamp: order.timestamp,
        });
        level.amount += remaining;

        self.index.insert(order.id.clone(), (order.side, key));
        self.touch(order.timestamp);
        Ok(())
    }

    /// Take a resting order out of its level, dropping the level if it
    /// empties. The caller passes the owning record so aggregates can be
    /// adjusted without a lookup.
    pub fn remove(&mut self, order: &Order, now: i64) -> Result<(), EngineError> {
        let (side, key) = self
            .index
            .remove(&order.id)
            .ok_or_else(|| EngineError::NotFound(order.id.clone()))?;

        let ladder = self.ladder_mut(side);
        if let Some(level) = ladder.get_mut(&key) {
            if let Some(pos) = level.slots.iter().position(|s| s.order_id == order.id) {
                level.slots.remove(pos);
                level.amount -= order.remaining();
            }
            if level.slots.is_empty() {
                ladder.remove(&key);
            }
        }
        self.touch(now);
        Ok(())
    }

    /// Reduce the head order of the given side's best level by `amount`,
    /// popping it when fully filled.
    pub fn fill_head(&mut self, side: Side, amount: Decimal, filled: bool, now: i64) {
        let Some(key) = self.best_key(side) else {
            return;
        };
        let mut popped = None;
        let ladder = self.ladder_mut(side);
        if let Some(level) = ladder.get_mut(&key) {
            level.amount -= amount;
            if filled {
                popped = level.slots.pop_front().map(|slot| slot.order_id);
            }
            if level.slots.is_empty() {
                ladder.remove(&key);
            }
        }
        if let Some(order_id) = popped {
            self.index.remove(&order_id);
        }
        self.touch(now);
    }

    /// Best price level for a side, if any.
    pub fn top(&self, side: Side) -> Option<&PriceLevel> {
        let key = self.best_key(side)?;
        self.ladder(side).get(&key)
    }

    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        self.top(side).map(|level| level.price)
    }

    /// Visit resting orders from the best price outward, FIFO within each
    /// level, stopping when the visitor returns false.
    pub fn walk(&self, side: Side, mut visit: impl FnMut(&LevelSlot, Decimal) -> bool) {
        let levels: Box<dyn Iterator<Item = &PriceLevel>> = match side {
            Side::Buy => Box::new(self.bids.values().rev()),
            Side::Sell => Box::new(self.asks.values()),
        };
        for level in levels {
            for slot in &level.slots {
                if !visit(slot, level.price) {
                    return;
                }
            }
        }
    }

    /// Top-N aggregated levels per side.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let view = |level: &PriceLevel| LevelView {
            price: level.price,
            amount: level.amount,
            order_count: level.order_count(),
        };
        BookSnapshot {
            pair: self.pair.clone(),
            bids: self.bids.values().rev().take(depth).map(view).collect(),
            asks: self.asks.values().take(depth).map(view).collect(),
            last_update: self.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType};
    use rust_decimal_macros::dec;

    fn resting_order(id: &str, side: Side, price: Decimal, amount: Decimal, ts: i64) -> Order {
        Order {
            id: id.to_string(),
            user_id: "0x1234".to_string(),
            pair: Pair::new("ETH", "USDC"),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            amount,
            filled: Decimal::ZERO,
            status: OrderStatus::Pending,
            cancel_reason: None,
            timestamp: ts,
            nonce: 0,
            signature: String::new(),
            chain_id: 1,
            expires_at: None,
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        let order = resting_order("o1", Side::Buy, dec!(2000), dec!(1), 1);

        book.insert(&order).unwrap();
        assert_eq!(book.order_count(), 1);
        assert!(book.contains("o1"));

        book.remove(&order, 2).unwrap();
        assert_eq!(book.order_count(), 0);
        assert!(!book.contains("o1"));
        assert!(book.top(Side::Buy).is_none());
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        let order = resting_order("ghost", Side::Buy, dec!(2000), dec!(1), 1);
        assert!(matches!(
            book.remove(&order, 1),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        let order = resting_order("o1", Side::Buy, dec!(2000), dec!(1), 1);
        book.insert(&order).unwrap();
        assert!(matches!(
            book.insert(&order),
            Err(EngineError::InvalidOrder(InvalidOrderKind::DuplicateId))
        ));
    }

    #[test]
    fn test_best_prices() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        book.insert(&resting_order("b1", Side::Buy, dec!(1999), dec!(1), 1))
            .unwrap();
        book.insert(&resting_order("b2", Side::Buy, dec!(2000), dec!(1), 2))
            .unwrap();
        book.insert(&resting_order("a1", Side::Sell, dec!(2001), dec!(1), 3))
            .unwrap();
        book.insert(&resting_order("a2", Side::Sell, dec!(2002), dec!(1), 4))
            .unwrap();

        assert_eq!(book.best_price(Side::Buy), Some(dec!(2000)));
        assert_eq!(book.best_price(Side::Sell), Some(dec!(2001)));
    }

    #[test]
    fn test_level_aggregates() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        book.insert(&resting_order("b1", Side::Buy, dec!(2000), dec!(1), 1))
            .unwrap();
        book.insert(&resting_order("b2", Side::Buy, dec!(2000), dec!(2), 2))
            .unwrap();

        let top = book.top(Side::Buy).unwrap();
        assert_eq!(top.amount, dec!(3));
        assert_eq!(top.order_count(), 2);
        assert_eq!(top.head().unwrap().order_id, "b1");
    }

    #[test]
    fn test_fifo_tie_break_by_id() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        // same timestamp; "a" sorts before "b"
        book.insert(&resting_order("b", Side::Sell, dec!(2000), dec!(1), 5))
            .unwrap();
        book.insert(&resting_order("a", Side::Sell, dec!(2000), dec!(1), 5))
            .unwrap();
        assert_eq!(book.top(Side::Sell).unwrap().head().unwrap().order_id, "a");
    }

    #[test]
    fn test_fill_head_pops_and_drops_level() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        book.insert(&resting_order("a1", Side::Sell, dec!(2000), dec!(1), 1))
            .unwrap();

        book.fill_head(Side::Sell, dec!(0.4), false, 2);
        assert_eq!(book.top(Side::Sell).unwrap().amount, dec!(0.6));
        assert!(book.contains("a1"));

        book.fill_head(Side::Sell, dec!(0.6), true, 3);
        assert!(book.top(Side::Sell).is_none());
        assert!(!book.contains("a1"));
    }

    #[test]
    fn test_walk_stops_on_false() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        book.insert(&resting_order("a1", Side::Sell, dec!(2000), dec!(1), 1))
            .unwrap();
        book.insert(&resting_order("a2", Side::Sell, dec!(2001), dec!(1), 2))
            .unwrap();
        book.insert(&resting_order("a3", Side::Sell, dec!(2002), dec!(1), 3))
            .unwrap();

        let mut seen = Vec::new();
        book.walk(Side::Sell, |slot, price| {
            seen.push(slot.order_id.clone());
            price < dec!(2001)
        });
        assert_eq!(seen, vec!["a1", "a2"]);
    }

    #[test]
    fn test_snapshot_depth_and_order() {
        let mut book = OrderBook::new(Pair::new("ETH", "USDC"));
        book.insert(&resting_order("b1", Side::Buy, dec!(1998), dec!(1), 1))
            .unwrap();
        book.insert(&resting_order("b2", Side::Buy, dec!(2000), dec!(2), 2))
            .unwrap();
        book.insert(&resting_order("b3", Side::Buy, dec!(1999), dec!(3), 3))
            .unwrap();
        book.insert(&resting_order("a1", Side::Sell, dec!(2002), dec!(1.5), 4))
            .unwrap();

        let snap = book.snapshot(2);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0].price, dec!(2000));
        assert_eq!(snap.bids[1].price, dec!(1999));
        assert_eq!(snap.asks.len(), 1);
        assert_eq!(snap.asks[0].amount, dec!(1.5));
    }
}
