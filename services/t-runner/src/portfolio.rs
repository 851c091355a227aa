//! Position account - cash and share tracking with T+1 settlement

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{Fill, Result, RunnerError, Side};

/// Cash and holdings for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionAccount {
    pub balance: Decimal,
    /// Includes shares bought this session
    pub total_shares: u64,
    /// Shares sellable this session
    pub available_shares: u64,
    /// Session the available count belongs to
    #[serde(default)]
    pub session_date: Option<NaiveDate>,
}

impl Default for PositionAccount {
    fn default() -> Self {
        Self {
            balance: Decimal::from(100_000),
            total_shares: 3000,
            available_shares: 3000,
            session_date: None,
        }
    }
}

/// Summary used in logs and replay output
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub total_shares: u64,
    pub available_shares: u64,
    pub market_value: Decimal,
    pub equity: Decimal,
}

impl PositionAccount {
    pub fn new(balance: Decimal, shares: u64) -> Self {
        Self {
            balance,
            total_shares: shares,
            available_shares: shares,
            session_date: None,
        }
    }

    /// Release yesterday's purchases when a new session starts
    pub fn roll_session(&mut self, today: NaiveDate) -> bool {
        if self.session_date == Some(today) {
            return false;
        }
        if self.available_shares != self.total_shares {
            debug!(
                "Session {}: available {} -> {}",
                today, self.available_shares, self.total_shares
            );
        }
        self.available_shares = self.total_shares;
        self.session_date = Some(today);
        true
    }

    /// Check a fill against the account without applying it
    pub fn validate_fill(&self, fill: &Fill) -> Result<()> {
        let amount = fill.price * Decimal::from(fill.volume);
        match fill.side {
            Side::Buy if amount > self.balance => Err(RunnerError::Fill(format!(
                "buy {} x {} needs {}, balance {}",
                fill.volume, fill.price, amount, self.balance
            ))),
            Side::Sell if fill.volume > self.available_shares => Err(RunnerError::Fill(format!(
                "sell {} exceeds available {}",
                fill.volume, self.available_shares
            ))),
            _ => Ok(()),
        }
    }

    /// Apply an acknowledged fill
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<()> {
        self.validate_fill(fill)?;
        let amount = fill.price * Decimal::from(fill.volume);
        match fill.side {
            Side::Buy => {
                // T+1: bought shares only become available next session
                self.balance -= amount;
                self.total_shares += fill.volume;
            }
            Side::Sell => {
                self.balance += amount;
                self.total_shares -= fill.volume;
                self.available_shares -= fill.volume;
            }
        }
        info!(
            "Account {}: {} {} @ {} | balance {} | shares {}/{}",
            fill.instrument,
            fill.side,
            fill.volume,
            fill.price,
            self.balance,
            self.available_shares,
            self.total_shares
        );
        Ok(())
    }

    pub fn snapshot(&self, price: Decimal) -> AccountSnapshot {
        let market_value = price * Decimal::from(self.total_shares);
        AccountSnapshot {
            balance: self.balance,
            total_shares: self.total_shares,
            available_shares: self.available_shares,
            market_value,
            equity: self.balance + market_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fill(side: Side, price: i64, volume: u64) -> Fill {
        Fill {
            order_id: Uuid::new_v4(),
            instrument: "600519".to_string(),
            side,
            price: Decimal::from(price),
            volume,
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_defaults() {
        let account = PositionAccount::default();
        assert_eq!(account.balance, Decimal::from(100_000));
        assert_eq!(account.total_shares, 3000);
        assert_eq!(account.available_shares, 3000);
    }

    #[test]
    fn test_buy_settles_next_session() {
        let mut account = PositionAccount::default();
        account.roll_session(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        account.apply_fill(&fill(Side::Buy, 10, 500)).unwrap();

        assert_eq!(account.balance, Decimal::from(95_000));
        assert_eq!(account.total_shares, 3500);
        assert_eq!(account.available_shares, 3000);

        assert!(!account.roll_session(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
        assert!(account.roll_session(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()));
        assert_eq!(account.available_shares, 3500);
    }

    #[test]
    fn test_sell_reduces_available() {
        let mut account = PositionAccount::default();
        account.apply_fill(&fill(Side::Sell, 10, 1000)).unwrap();
        assert_eq!(account.balance, Decimal::from(110_000));
        assert_eq!(account.total_shares, 2000);
        assert_eq!(account.available_shares, 2000);
        assert!(account.available_shares <= account.total_shares);
    }

    #[test]
    fn test_invalid_fills_rejected() {
        let mut account = PositionAccount::new(Decimal::from(500), 100);
        assert!(account.apply_fill(&fill(Side::Buy, 10, 100)).is_err());
        assert!(account.apply_fill(&fill(Side::Sell, 10, 200)).is_err());
        assert_eq!(account, PositionAccount::new(Decimal::from(500), 100));
    }
}
