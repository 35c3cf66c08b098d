use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::Side;
use super::pair::Pair;

/// An executed fill between one taker and one maker. Immutable once emitted;
/// `batch_id` is stamped later by the batch builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub taker_order_id: String,
    pub maker_order_id: String,
    pub pair: Pair,
    /// Taker's side
    pub side: Side,
    /// Maker's price
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    /// Millisecond epoch, taken from the taker's ingress timestamp
    pub timestamp: i64,
    pub batch_id: Option<Uuid>,
    pub chain_id: i64,
}

impl Trade {
    /// Quote-denominated notional of the fill.
    pub fn notional(&self) -> Decimal {
        self.price * self.amount
    }
}
