//! Shared domain types for the decision engine and execution pipeline

use chrono::NaiveDateTime;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// One OHLCV bar. Timestamps are exchange-local.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Traded shares
    pub volume: f64,
    /// Traded notional; 0 when the source does not report it
    #[serde(default)]
    pub amount: f64,
}

/// Quote snapshot returned by the quote source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub amount: f64,
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
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

/// Direction of an open round trip, named after its opening leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BuyFirst,
    SellFirst,
}

impl Direction {
    pub fn from_opening(side: Side) -> Self {
        match side {
            Side::Buy => Direction::BuyFirst,
            Side::Sell => Direction::SellFirst,
        }
    }

    pub fn opening_side(self) -> Side {
        match self {
            Direction::BuyFirst => Side::Buy,
            Direction::SellFirst => Side::Sell,
        }
    }

    pub fn closing_side(self) -> Side {
        self.opening_side().opposite()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::BuyFirst => write!(f, "buy_first"),
            Direction::SellFirst => write!(f, "sell_first"),
        }
    }
}

/// Raw strategy output before eligibility filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    #[default]
    None,
    Buy,
    Sell,
}

impl Signal {
    pub fn side(self) -> Option<Side> {
        match self {
            Signal::None => None,
            Signal::Buy => Some(Side::Buy),
            Signal::Sell => Some(Side::Sell),
        }
    }
}

impl From<Side> for Signal {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => Signal::Buy,
            Side::Sell => Signal::Sell,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::None => write!(f, "none"),
            Signal::Buy => write!(f, "buy"),
            Signal::Sell => write!(f, "sell"),
        }
    }
}

/// Execution report delivered by the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub timestamp: NaiveDateTime,
}

/// Persisted trade history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub amount: Decimal,
    pub timestamp: NaiveDateTime,
    pub loop_id: Uuid,
}

/// Convert a quote price to cents precision
pub fn price_to_decimal(price: f64) -> Option<Decimal> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Decimal::from_f64(price).map(|p| p.round_dp(2))
}

/// Errors raised by the runner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quote error: {0}")]
    Quote(String),

    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Fill rejected: {0}")]
    Fill(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::from_opening(Side::Buy), Direction::BuyFirst);
        assert_eq!(Direction::BuyFirst.closing_side(), Side::Sell);
        assert_eq!(Direction::SellFirst.closing_side(), Side::Buy);
        assert_eq!(Direction::SellFirst.to_string(), "sell_first");
    }

    #[test]
    fn test_price_to_decimal() {
        assert_eq!(price_to_decimal(10.104), Some(Decimal::new(1010, 2)));
        assert_eq!(price_to_decimal(0.0), None);
        assert_eq!(price_to_decimal(f64::NAN), None);
    }
}
