//! Trade-loop state machine
//!
//! An instrument is either `Flat` or holds exactly one open round trip
//! waiting for its closing leg. While a loop is open only the closing side
//! is eligible, whatever the score says.

use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::regime::Regime;
use crate::types::{Direction, Fill, Result, RunnerError, Side};

/// One round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLoop {
    pub id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub open_price: Decimal,
    pub open_volume: u64,
    pub open_time: NaiveDateTime,
    pub closed: bool,
    pub close_price: Option<Decimal>,
    pub close_volume: Option<u64>,
    pub close_time: Option<NaiveDateTime>,
    pub profit: Option<Decimal>,
}

impl TradeLoop {
    pub fn open(
        instrument: &str,
        direction: Direction,
        price: Decimal,
        volume: u64,
        time: NaiveDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            direction,
            open_price: price,
            open_volume: volume,
            open_time: time,
            closed: false,
            close_price: None,
            close_volume: None,
            close_time: None,
            profit: None,
        }
    }

    /// Realized profit of closing `volume` at `price`
    pub fn profit_at(&self, price: Decimal, volume: u64) -> Decimal {
        let per_share = match self.direction {
            Direction::BuyFirst => price - self.open_price,
            Direction::SellFirst => self.open_price - price,
        };
        per_share * Decimal::from(volume)
    }

    /// Close the loop and return the realized profit
    pub fn close(&mut self, price: Decimal, volume: u64, time: NaiveDateTime) -> Decimal {
        let profit = self.profit_at(price, volume);
        self.closed = true;
        self.close_price = Some(price);
        self.close_volume = Some(volume);
        self.close_time = Some(time);
        self.profit = Some(profit);
        profit
    }

    /// Opened on an earlier calendar day than `now`
    pub fn is_overnight(&self, now: NaiveDateTime) -> bool {
        self.open_time.date() < now.date()
    }

    /// Price at which an overnight loop is closed by ratio
    pub fn overnight_target(&self, config: &StrategyConfig) -> Decimal {
        let hundred = Decimal::ONE_HUNDRED;
        match self.direction {
            Direction::BuyFirst => self.open_price * (Decimal::ONE + config.overnight_sell_ratio / hundred),
            Direction::SellFirst => self.open_price * (Decimal::ONE - config.overnight_buy_ratio / hundred),
        }
    }

    /// Whether `price` reaches the overnight ratio target
    pub fn overnight_target_reached(&self, price: Decimal, config: &StrategyConfig) -> bool {
        let target = self.overnight_target(config);
        match self.direction {
            Direction::BuyFirst => price >= target,
            Direction::SellFirst => price <= target,
        }
    }
}

/// Per-instrument loop state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LoopState {
    #[default]
    Flat,
    PendingClose(TradeLoop),
}

impl LoopState {
    pub fn from_open_loop(open: Option<TradeLoop>) -> Self {
        match open {
            Some(l) if !l.closed => LoopState::PendingClose(l),
            _ => LoopState::Flat,
        }
    }

    pub fn open_loop(&self) -> Option<&TradeLoop> {
        match self {
            LoopState::Flat => None,
            LoopState::PendingClose(l) => Some(l),
        }
    }

    /// Apply an acknowledged fill.
    ///
    /// Returns the loop after the transition: freshly opened or just closed.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<Transition> {
        match self {
            LoopState::Flat => {
                let opened = TradeLoop::open(
                    &fill.instrument,
                    Direction::from_opening(fill.side),
                    fill.price,
                    fill.volume,
                    fill.timestamp,
                );
                info!(
                    "🔓 {} loop opened: {} {} @ {}",
                    opened.instrument, opened.direction, opened.open_volume, opened.open_price
                );
                *self = LoopState::PendingClose(opened.clone());
                Ok(Transition::Opened(opened))
            }
            LoopState::PendingClose(open) => {
                if fill.side != open.direction.closing_side() {
                    return Err(RunnerError::Fill(format!(
                        "{} fill on {} while a {} loop is open",
                        fill.side, fill.instrument, open.direction
                    )));
                }
                let mut closed = open.clone();
                let profit = closed.close(fill.price, fill.volume, fill.timestamp);
                info!(
                    "🔒 {} loop closed: {} @ {} -> {}, profit {}",
                    closed.instrument, closed.direction, closed.open_price, fill.price, profit
                );
                *self = LoopState::Flat;
                Ok(Transition::Closed(closed))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened(TradeLoop),
    Closed(TradeLoop),
}

/// Result of the eligibility check
#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    /// Opens a new loop in this direction
    Open(Direction),
    /// Closes the pending loop
    Close(TradeLoop),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    ClosedLoopLock { direction: Direction },
    RegimeForbidsEntry { regime: Regime },
    EntryCutoff { cutoff: NaiveTime },
    NoAvailableHoldings { available: u64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ClosedLoopLock { direction } => write!(
                f,
                "closed-loop lock: only closing signals accepted ({} pending)",
                direction
            ),
            RejectReason::RegimeForbidsEntry { regime } => {
                write!(f, "regime forbids entry ({})", regime)
            }
            RejectReason::EntryCutoff { cutoff } => {
                write!(f, "no new entries after {}", cutoff.format("%H:%M"))
            }
            RejectReason::NoAvailableHoldings { available } => {
                write!(f, "no available holdings to sell first ({} available)", available)
            }
        }
    }
}

/// Inputs to the eligibility check besides the signal itself
#[derive(Debug, Clone, Copy)]
pub struct EntryContext {
    pub time: NaiveTime,
    pub entry_cutoff: NaiveTime,
    pub regime: Regime,
    pub regime_allows_entry: bool,
    pub available_shares: u64,
    pub lot_size: u64,
}

/// Decide whether `side` may act on the current loop state
pub fn evaluate_eligibility(state: &LoopState, side: Side, ctx: &EntryContext) -> Eligibility {
    match state {
        LoopState::PendingClose(open) => {
            if side == open.direction.closing_side() {
                Eligibility::Close(open.clone())
            } else {
                Eligibility::Rejected(RejectReason::ClosedLoopLock { direction: open.direction })
            }
        }
        LoopState::Flat => {
            if ctx.time >= ctx.entry_cutoff {
                return Eligibility::Rejected(RejectReason::EntryCutoff { cutoff: ctx.entry_cutoff });
            }
            if !ctx.regime_allows_entry {
                return Eligibility::Rejected(RejectReason::RegimeForbidsEntry { regime: ctx.regime });
            }
            if side == Side::Sell && ctx.available_shares < ctx.lot_size.max(1) {
                return Eligibility::Rejected(RejectReason::NoAvailableHoldings {
                    available: ctx.available_shares,
                });
            }
            Eligibility::Open(Direction::from_opening(side))
        }
    }
}

/// Latest time a new loop may open, tightened on weak days
pub fn entry_cutoff(config: &StrategyConfig, instrument_weak: bool, regime: Regime) -> NaiveTime {
    let mut cutoff = config.no_new_entry_after;
    if instrument_weak {
        cutoff = cutoff.min(config.weak_stock_entry_cutoff);
    }
    if regime == Regime::Weak {
        cutoff = cutoff.min(config.weak_market_entry_cutoff);
    }
    cutoff
}
