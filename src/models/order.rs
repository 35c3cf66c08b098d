use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::pair::Pair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a taker on `self` matches against.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "limit"),
            OrderType::Market => write!(f, "market"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Resting in the book, no fills yet
    Pending,
    /// Resting in the book with at least one fill
    Partial,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses admit no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Partial => write!(f, "partial"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "partial" => Ok(OrderStatus::Partial),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "expired" => Ok(OrderStatus::Expired),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Why an order reached `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequest,
    /// Market order remainder after the opposite book was exhausted
    UnfilledMarket,
}

/// An admitted order. Created by the matching engine and mutated only by it;
/// terminal orders are never touched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub pair: Pair,
    pub side: Side,
    pub order_type: OrderType,
    /// None for market orders (priced as +inf for buys, 0 for sells)
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub status: OrderStatus,
    pub cancel_reason: Option<CancelReason>,
    /// Ingress timestamp, millisecond epoch, monotonic per market
    pub timestamp: i64,
    pub nonce: i64,
    /// Opaque provenance tag; verification happens upstream
    pub signature: String,
    pub chain_id: i64,
    pub expires_at: Option<i64>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.amount - self.filled
    }

    /// True while the order may sit in a book level queue.
    pub fn is_resting(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Partial)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Signed trading intent as handed over by the transport layer. Prices and
/// amounts arrive as decimal strings and are parsed at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: String,
    pub user_id: String,
    pub pair: Pair,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<String>,
    pub amount: String,
    pub timestamp: i64,
    pub nonce: i64,
    pub signature: String,
    pub chain_id: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Cancel request from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelIntent {
    pub order_id: String,
    pub requester_id: String,
}
