//! Signal generation
//!
//! Turns the scored feature row into a raw buy/sell signal for the configured
//! strategy. Eligibility (closed-loop lock, cutoffs, regime) is applied after
//! this step by the trade-loop state machine.

use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::{StrategyConfig, StrategyKind};
use crate::indicators::FeatureRow;
use crate::regime::{Regime, RegimeAssessment};
use crate::trade_loop::{LoopState, TradeLoop};
use crate::types::{Direction, Signal};

/// Intraday values of the current session
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionContext {
    /// Last close of the previous session
    pub prev_close: Option<f64>,
    pub day_open: f64,
    pub day_high: f64,
    pub day_low: f64,
}

/// Everything one signal evaluation sees
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    pub config: &'a StrategyConfig,
    pub row: &'a FeatureRow,
    pub score: f64,
    pub regime: &'a RegimeAssessment,
    pub state: &'a LoopState,
    pub session: &'a SessionContext,
    pub price: Decimal,
    pub now: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalDecision {
    pub signal: Signal,
    pub reason: String,
}

impl SignalDecision {
    fn none(reason: impl Into<String>) -> Self {
        Self { signal: Signal::None, reason: reason.into() }
    }

    fn new(signal: Signal, reason: impl Into<String>) -> Self {
        Self { signal, reason: reason.into() }
    }
}

/// Steps the grid spacing is snapped to
const NICE_STEPS: [f64; 13] = [0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0];

pub fn generate(input: &StrategyInput<'_>) -> SignalDecision {
    // Overnight loops close on the ratio target first; otherwise the normal
    // strategy path runs restricted to the closing side.
    if let LoopState::PendingClose(open) = input.state {
        if open.is_overnight(input.now) && open.overnight_target_reached(input.price, input.config) {
            return SignalDecision::new(
                open.direction.closing_side().into(),
                format!(
                    "overnight target {} reached at {}",
                    open.overnight_target(input.config).round_dp(3),
                    input.price
                ),
            );
        }
    }

    match input.config.strategy {
        StrategyKind::MultiFactor => multi_factor(input),
        StrategyKind::Percentage => percentage(input),
        StrategyKind::Grid => grid(input),
    }
}

fn multi_factor(input: &StrategyInput<'_>) -> SignalDecision {
    let row = input.row;
    let required = input.regime.required_score;
    let target = row.dynamic_profit_target.unwrap_or(input.config.base_profit_target);

    match input.state {
        LoopState::Flat => {
            if input.score >= required {
                return SignalDecision::new(
                    Signal::Buy,
                    format!("score {:.2} >= {:.2} ({})", input.score, required, input.regime.regime),
                );
            }
            // Extended above VWAP near the day high: sell part of the core first
            let extended = row.intraday_position >= 0.85 && row.vwap_deviation >= target;
            if extended && input.regime.regime != Regime::Strong {
                return SignalDecision::new(
                    Signal::Sell,
                    format!(
                        "extended {:.2}% above vwap at {:.0}% of range",
                        row.vwap_deviation * 100.0,
                        row.intraday_position * 100.0
                    ),
                );
            }
            SignalDecision::none(format!("score insufficient ({:.2} < {:.2})", input.score, required))
        }
        LoopState::PendingClose(open) => {
            let Some(gain) = loop_gain(open, input.price) else {
                return SignalDecision::none("invalid open price");
            };
            let close = open.direction.closing_side().into();

            if gain >= target {
                return SignalDecision::new(close, format!("take profit {:.2}% >= {:.2}%", gain * 100.0, target * 100.0));
            }
            if gain <= -input.config.stop_loss_pct {
                return SignalDecision::new(close, format!("stop loss {:.2}%", gain * 100.0));
            }
            if input.now.time() >= input.config.force_close_at {
                return SignalDecision::new(close, format!("force close at {}", input.config.force_close_at.format("%H:%M")));
            }
            if open.direction == Direction::SellFirst && input.score >= required {
                return SignalDecision::new(
                    Signal::Buy,
                    format!("buy back on score {:.2} >= {:.2}", input.score, required),
                );
            }
            SignalDecision::none(format!("holding {} loop ({:+.2}%)", open.direction, gain * 100.0))
        }
    }
}

fn percentage(input: &StrategyInput<'_>) -> SignalDecision {
    let reference = match input.state {
        LoopState::PendingClose(open) => open.open_price.to_f64(),
        LoopState::Flat => input.session.prev_close,
    };
    let (Some(reference), Some(price)) = (reference.filter(|r| *r > 0.0), input.price.to_f64()) else {
        return SignalDecision::none("no reference price");
    };

    let diff_pct = (price / reference - 1.0) * 100.0;
    let params = input.config.percentage;
    if diff_pct >= params.sell_threshold_pct {
        SignalDecision::new(Signal::Sell, format!("up {:.2}% >= {:.2}%", diff_pct, params.sell_threshold_pct))
    } else if diff_pct <= -params.buy_threshold_pct {
        SignalDecision::new(Signal::Buy, format!("down {:.2}% <= -{:.2}%", diff_pct, params.buy_threshold_pct))
    } else {
        SignalDecision::none(format!("change {:+.2}% inside band", diff_pct))
    }
}

fn grid(input: &StrategyInput<'_>) -> SignalDecision {
    let session = input.session;
    let Some(step) = grid_step(session.day_high - session.day_low, input.config.grid.min_cells, input.config.grid.max_cells)
    else {
        return SignalDecision::none("no intraday range for grid");
    };
    let reference = match input.state {
        LoopState::PendingClose(open) => open.open_price.to_f64().unwrap_or(session.day_open),
        LoopState::Flat => session.day_open,
    };
    let Some(price) = input.price.to_f64() else {
        return SignalDecision::none("invalid price");
    };

    // small tolerance so a price printed exactly on a grid line counts
    let eps = step * 1e-6;
    if price <= reference - step + eps {
        SignalDecision::new(Signal::Buy, format!("grid buy at {:.2} (step {})", price, step))
    } else if price >= reference + step - eps {
        SignalDecision::new(Signal::Sell, format!("grid sell at {:.2} (step {})", price, step))
    } else {
        SignalDecision::none(format!("inside grid cell around {:.2} (step {})", reference, step))
    }
}

/// Grid spacing from the day's range.
///
/// Picks the largest step from [`NICE_STEPS`] that splits the range into
/// `min_cells..=max_cells` cells, falling back to the step closest to the
/// middle cell count.
pub fn grid_step(range: f64, min_cells: u32, max_cells: u32) -> Option<f64> {
    if !range.is_finite() || range <= 0.0 {
        return None;
    }
    let fitting = NICE_STEPS.iter().rev().find(|&&step| {
        let cells = range / step;
        cells >= f64::from(min_cells) && cells <= f64::from(max_cells)
    });
    if let Some(step) = fitting {
        return Some(*step);
    }

    let ideal = range / (f64::from(min_cells + max_cells) / 2.0);
    NICE_STEPS
        .iter()
        .copied()
        .min_by(|a, b| (a - ideal).abs().total_cmp(&(b - ideal).abs()))
}

/// Fractional gain of the open loop at `price`, positive when favourable
fn loop_gain(open: &TradeLoop, price: Decimal) -> Option<f64> {
    if open.open_price <= Decimal::ZERO {
        return None;
    }
    let ratio = (price / open.open_price).to_f64()?;
    Some(match open.direction {
        Direction::BuyFirst => ratio - 1.0,
        Direction::SellFirst => 1.0 - ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::classify;
    use crate::scorer::tests::neutral_row;
    use chrono::{NaiveDate, NaiveTime};

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn normal() -> RegimeAssessment {
        classify(0.2, false, NaiveTime::from_hms_opt(11, 0, 0).unwrap(), NaiveTime::from_hms_opt(10, 40, 0).unwrap())
    }

    fn run(
        config: &StrategyConfig,
        state: &LoopState,
        score: f64,
        price: Decimal,
        now: NaiveDateTime,
        session: &SessionContext,
    ) -> SignalDecision {
        let row = neutral_row();
        let regime = normal();
        generate(&StrategyInput { config, row: &row, score, regime: &regime, state, session, price, now })
    }

    #[test]
    fn test_flat_buy_on_score() {
        let config = StrategyConfig::new("600519");
        let session = SessionContext::default();
        let decision = run(&config, &LoopState::Flat, 0.60, Decimal::TEN, at(1, 10, 30), &session);
        assert_eq!(decision.signal, Signal::Buy);

        let decision = run(&config, &LoopState::Flat, 0.40, Decimal::TEN, at(1, 10, 30), &session);
        assert_eq!(decision.signal, Signal::None);
        assert!(decision.reason.starts_with("score insufficient"));
    }

    #[test]
    fn test_buy_first_exits() {
        let config = StrategyConfig::new("600519");
        let session = SessionContext::default();
        let open = TradeLoop::open("600519", Direction::BuyFirst, Decimal::TEN, 100, at(1, 10, 0));
        let state = LoopState::PendingClose(open);

        // dynamic target 1% from the neutral row
        let profit = run(&config, &state, 0.0, Decimal::new(1010, 2), at(1, 11, 0), &session);
        assert_eq!(profit.signal, Signal::Sell);
        assert!(profit.reason.starts_with("take profit"));

        let stop = run(&config, &state, 0.0, Decimal::new(992, 2), at(1, 11, 0), &session);
        assert_eq!(stop.signal, Signal::Sell);

        let hold = run(&config, &state, 0.9, Decimal::new(1005, 2), at(1, 11, 0), &session);
        assert_eq!(hold.signal, Signal::None);

        let forced = run(&config, &state, 0.0, Decimal::new(1005, 2), at(1, 14, 50), &session);
        assert_eq!(forced.signal, Signal::Sell);
    }

    #[test]
    fn test_overnight_ratio_checked_first() {
        let config = StrategyConfig::new("600519").with_strategy(StrategyKind::Percentage);
        let session = SessionContext { prev_close: Some(10.0), ..Default::default() };
        let open = TradeLoop::open("600519", Direction::BuyFirst, Decimal::TEN, 100, at(1, 10, 0));
        let state = LoopState::PendingClose(open);

        let next_day = at(4, 9, 40);
        let reached = run(&config, &state, 0.0, Decimal::new(1010, 2), next_day, &session);
        assert_eq!(reached.signal, Signal::Sell);
        assert!(reached.reason.starts_with("overnight target"));

        // below the ratio target the percentage path still runs
        let below = run(&config, &state, 0.0, Decimal::new(1006, 2), next_day, &session);
        assert_eq!(below.signal, Signal::Sell);
        assert!(below.reason.starts_with("up"));
    }

    #[test]
    fn test_percentage_band() {
        let config = StrategyConfig::new("600519").with_strategy(StrategyKind::Percentage);
        let session = SessionContext { prev_close: Some(10.0), ..Default::default() };
        let now = at(1, 10, 0);
        assert_eq!(run(&config, &LoopState::Flat, 0.0, Decimal::new(994, 2), now, &session).signal, Signal::Buy);
        assert_eq!(run(&config, &LoopState::Flat, 0.0, Decimal::new(1006, 2), now, &session).signal, Signal::Sell);
        assert_eq!(run(&config, &LoopState::Flat, 0.0, Decimal::new(1002, 2), now, &session).signal, Signal::None);
    }

    #[test]
    fn test_grid_step_selection() {
        assert_eq!(grid_step(0.70, 6, 8), Some(0.1));
        assert_eq!(grid_step(1.4, 6, 8), Some(0.2));
        assert_eq!(grid_step(0.0, 6, 8), None);
        // 0.35 / 7 = 0.05 exactly
        assert_eq!(grid_step(0.35, 6, 8), Some(0.05));
    }

    #[test]
    fn test_grid_signals() {
        let config = StrategyConfig::new("600519").with_strategy(StrategyKind::Grid);
        let session = SessionContext { prev_close: None, day_open: 10.0, day_high: 10.4, day_low: 9.7 };
        let now = at(1, 10, 0);
        assert_eq!(run(&config, &LoopState::Flat, 0.0, Decimal::new(990, 2), now, &session).signal, Signal::Buy);
        assert_eq!(run(&config, &LoopState::Flat, 0.0, Decimal::new(1010, 2), now, &session).signal, Signal::Sell);
        assert_eq!(run(&config, &LoopState::Flat, 0.0, Decimal::new(1005, 2), now, &session).signal, Signal::None);
    }
}
