//! Matching engine types and DTOs.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::models::decimal::{self, DecimalError, AMOUNT_SCALE};
use crate::models::{Order, Pair, Trade};

// ============================================================================
// Price key
// ============================================================================

/// Book key with 8 decimal digits of precision, stored as scaled `i64` for
/// exact ordering and hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i64);

const PRICE_KEY_UNIT: i64 = 100_000_000;

impl PriceKey {
    /// Convert a validated price. Fails on excess scale or a magnitude the
    /// scaled representation cannot hold.
    pub fn try_from_decimal(price: Decimal) -> Result<Self, DecimalError> {
        let scaled = price
            .checked_mul(Decimal::from(PRICE_KEY_UNIT))
            .ok_or(DecimalError::Overflow)?;
        if scaled.normalize().scale() != 0 {
            return Err(DecimalError::ExcessScale {
                value: price.to_string(),
                max: 8,
            });
        }
        i64::try_from(scaled.normalize().mantissa())
            .map(PriceKey)
            .map_err(|_| DecimalError::OutOfRange(price.to_string()))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PRICE_KEY_UNIT)
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book snapshot
// ============================================================================

/// One aggregated price level as exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelView {
    pub price: Decimal,
    pub amount: Decimal,
    pub order_count: usize,
}

/// Top-N view of both sides of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: Pair,
    /// Highest price first
    pub bids: Vec<LevelView>,
    /// Lowest price first
    pub asks: Vec<LevelView>,
    pub last_update: i64,
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of an admitted `place`: the taker's final state plus every fill
/// it produced, in execution order.
#[derive(Debug, Clone)]
pub struct PlaceResult {
    pub order: Order,
    pub trades: Vec<Trade>,
}

// ============================================================================
// Errors
// ============================================================================

/// Structural admission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidOrderKind {
    DuplicateId,
    EmptyId,
    MalformedAmount,
    NonPositiveAmount,
    AmountPrecision,
    AmountOutOfRange,
    MissingPrice,
    MalformedPrice,
    NonPositivePrice,
    PricePrecision,
    PriceOutOfRange,
    WrongMarket,
}

impl std::fmt::Display for InvalidOrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvalidOrderKind::DuplicateId => "duplicate order id",
            InvalidOrderKind::EmptyId => "empty order id",
            InvalidOrderKind::MalformedAmount => "amount is not a valid decimal",
            InvalidOrderKind::NonPositiveAmount => "amount must be positive",
            InvalidOrderKind::AmountPrecision => "amount has too many fractional digits",
            InvalidOrderKind::AmountOutOfRange => "amount out of supported range",
            InvalidOrderKind::MissingPrice => "limit order requires a price",
            InvalidOrderKind::MalformedPrice => "price is not a valid decimal",
            InvalidOrderKind::NonPositivePrice => "price must be positive",
            InvalidOrderKind::PricePrecision => "price has too many fractional digits",
            InvalidOrderKind::PriceOutOfRange => "price out of representable range",
            InvalidOrderKind::WrongMarket => "order pair does not match this market",
        };
        write!(f, "{s}")
    }
}

/// Matching engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid order: {0}")]
    InvalidOrder(InvalidOrderKind),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("requester {requester_id} does not own order {order_id}")]
    NotOwner {
        order_id: String,
        requester_id: String,
    },

    #[error("order not cancellable: {0}")]
    NotCancellable(String),

    #[error("order expired before admission: {0}")]
    Expired(String),

    #[error("unknown market: {0}")]
    UnknownMarket(Pair),

    #[error("durable store unavailable, engine degraded")]
    StoreUnavailable,

    #[error("engine shutting down")]
    Shutdown,
}

// ============================================================================
// Fee policy
// ============================================================================

/// Per-trade fee policy. The recorded fee is the taker-side fee on the
/// fill's quote notional, rounded down to the amount scale.
#[derive(Debug, Clone)]
pub struct FeePolicy {
    pub rate: Decimal,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            rate: Decimal::new(5, 4), // 0.05%
        }
    }
}

impl FeePolicy {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }

    pub fn trade_fee(&self, price: Decimal, amount: Decimal) -> Result<Decimal, DecimalError> {
        let notional = decimal::mul_round(price, amount, AMOUNT_SCALE, RoundingStrategy::ToZero)?;
        decimal::mul_round(notional, self.rate, AMOUNT_SCALE, RoundingStrategy::ToZero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_key_round_trip() {
        let price = dec!(97500.12345678);
        let key = PriceKey::try_from_decimal(price).unwrap();
        assert_eq!(key.to_decimal(), price);
    }

    #[test]
    fn test_price_key_ordering() {
        let lo = PriceKey::try_from_decimal(dec!(100)).unwrap();
        let hi = PriceKey::try_from_decimal(dec!(200)).unwrap();
        assert!(lo < hi);
    }

    #[test]
    fn test_price_key_rejects_excess_scale() {
        assert!(PriceKey::try_from_decimal(dec!(1.123456789)).is_err());
    }

    #[test]
    fn test_price_key_rejects_out_of_range() {
        let huge = Decimal::from(i64::MAX);
        assert!(PriceKey::try_from_decimal(huge).is_err());
    }

    #[test]
    fn test_default_fee() {
        let policy = FeePolicy::default();
        // 1 @ 2000 -> 2000 * 0.0005 = 1
        assert_eq!(policy.trade_fee(dec!(2000), dec!(1)).unwrap(), dec!(1.0));
    }
}
