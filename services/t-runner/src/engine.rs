//! Decision engine
//!
//! Synchronous and side-effect free: bars, loop state and account in, one
//! [`Decision`] out. The runner owns every suspension point around it.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::indicators::{self, IndicatorParams};
use crate::portfolio::PositionAccount;
use crate::regime::{self, Regime, RegimeClassifier};
use crate::scorer::{self, ScoreBreakdown};
use crate::sizing::{size_order, Sizing};
use crate::strategy::{self, SessionContext, StrategyInput};
use crate::trade_loop::{entry_cutoff, evaluate_eligibility, Eligibility, EntryContext, LoopState};
use crate::types::{Bar, Side, Signal};

/// Order the runner should submit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOrder {
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    /// Loop this order closes, if any
    pub closes_loop: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Verdict {
    /// Not enough data this tick
    NotReady,
    NoSignal,
    Rejected,
    /// Eligible but sized below one lot
    Dropped,
    Order(PlannedOrder),
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub instrument: String,
    pub timestamp: NaiveDateTime,
    pub signal: Signal,
    pub reason: String,
    pub score: Option<f64>,
    pub breakdown: Option<ScoreBreakdown>,
    pub threshold: Option<f64>,
    pub regime: Option<Regime>,
    pub verdict: Verdict,
}

impl Decision {
    fn not_ready(instrument: &str, now: NaiveDateTime, reason: String) -> Self {
        Self {
            instrument: instrument.to_string(),
            timestamp: now,
            signal: Signal::None,
            reason,
            score: None,
            breakdown: None,
            threshold: None,
            regime: None,
            verdict: Verdict::NotReady,
        }
    }

    pub fn planned_order(&self) -> Option<&PlannedOrder> {
        match &self.verdict {
            Verdict::Order(order) => Some(order),
            _ => None,
        }
    }
}

/// Inputs for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub config: &'a StrategyConfig,
    pub bars: &'a [Bar],
    pub benchmark_bars: &'a [Bar],
    pub yesterday_volume: Option<f64>,
    pub price: Decimal,
    pub now: NaiveDateTime,
    pub state: &'a LoopState,
    pub account: &'a PositionAccount,
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionEngine {
    params: IndicatorParams,
    classifier: RegimeClassifier,
    lot_size: u64,
}

impl DecisionEngine {
    pub fn new(params: IndicatorParams, benchmark_bar_minutes: u32, lot_size: u64) -> Self {
        Self {
            params,
            classifier: RegimeClassifier::new(benchmark_bar_minutes),
            lot_size: lot_size.max(1),
        }
    }

    pub fn lot_size(&self) -> u64 {
        self.lot_size
    }

    pub fn evaluate(&self, input: &DecisionInput<'_>) -> Decision {
        let config = input.config;
        let instrument = config.instrument.as_str();
        let params = self.params.with_base_profit_target(config.base_profit_target);

        let frame = match indicators::compute(input.bars, input.yesterday_volume, &params) {
            Ok(frame) => frame,
            Err(not_ready) => return Decision::not_ready(instrument, input.now, not_ready.to_string()),
        };
        let Some(row) = frame.latest() else {
            return Decision::not_ready(instrument, input.now, "empty feature frame".to_string());
        };

        let breakdown = scorer::score(row);
        let score = breakdown.total();

        let assessment = if config.market_filter_enabled {
            let benchmark = indicators::compute_benchmark(input.benchmark_bars, &self.params).ok();
            self.classifier
                .assess(benchmark.as_ref(), input.now, row.is_weak_market, config.early_session_until)
        } else {
            regime::filter_disabled()
        };

        let session = session_context(input.bars, input.now);
        let signal = strategy::generate(&StrategyInput {
            config,
            row,
            score,
            regime: &assessment,
            state: input.state,
            session: &session,
            price: input.price,
            now: input.now,
        });

        let mut decision = Decision {
            instrument: instrument.to_string(),
            timestamp: input.now,
            signal: signal.signal,
            reason: signal.reason,
            score: Some(score),
            breakdown: Some(breakdown),
            threshold: Some(assessment.required_score),
            regime: Some(assessment.regime),
            verdict: Verdict::NoSignal,
        };

        let Some(side) = signal.signal.side() else {
            return decision;
        };

        let ctx = EntryContext {
            time: input.now.time(),
            entry_cutoff: entry_cutoff(config, row.is_weak_market, assessment.regime),
            regime: assessment.regime,
            regime_allows_entry: assessment.allow_entry,
            available_shares: input.account.available_shares,
            lot_size: self.lot_size,
        };

        let closing = match evaluate_eligibility(input.state, side, &ctx) {
            Eligibility::Rejected(reason) => {
                decision.reason = format!("{} [{}]", reason, decision.reason);
                decision.verdict = Verdict::Rejected;
                return decision;
            }
            Eligibility::Open(_) => None,
            Eligibility::Close(open) => Some(open),
        };

        match size_order(side, input.price, config, input.account, closing.as_ref(), self.lot_size) {
            Sizing::Order(volume) => {
                decision.verdict = Verdict::Order(PlannedOrder {
                    side,
                    price: input.price,
                    volume,
                    closes_loop: closing.map(|l| l.id),
                });
            }
            Sizing::Dropped { requested, clamped } => {
                decision.reason = format!(
                    "order below one lot ({} requested, {} after limits) [{}]",
                    requested, clamped, decision.reason
                );
                decision.verdict = Verdict::Dropped;
            }
        }
        decision
    }
}

/// Previous close and today's open/high/low from the bar window
pub fn session_context(bars: &[Bar], now: NaiveDateTime) -> SessionContext {
    let today = now.date();
    let prev_close = bars
        .iter()
        .rev()
        .find(|b| b.timestamp.date() < today)
        .map(|b| b.close);

    let mut today_bars = bars.iter().filter(|b| b.timestamp.date() == today);
    let Some(first) = today_bars.next() else {
        return SessionContext { prev_close, ..Default::default() };
    };
    let (high, low) = today_bars.fold((first.high, first.low), |(h, l), b| (h.max(b.high), l.min(b.low)));

    SessionContext { prev_close, day_open: first.open, day_high: high, day_low: low }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyKind;
    use crate::trade_loop::TradeLoop;
    use crate::types::Direction;
    use chrono::{Duration, NaiveDate};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    /// 60 one-minute bars from 09:30, flat at 10.00 with the last bar at 9.50
    fn falling_bars(date: NaiveDate) -> Vec<Bar> {
        let start = date.and_hms_opt(9, 30, 0).unwrap();
        (0..60)
            .map(|i| {
                let close = if i == 59 { 9.5 } else { 10.0 };
                Bar {
                    timestamp: start + Duration::minutes(i),
                    open: close,
                    high: close + 0.05,
                    low: close - 0.05,
                    close,
                    volume: 1000.0,
                    amount: 0.0,
                }
            })
            .collect()
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(IndicatorParams::default(), 5, 100)
    }

    fn evaluate(config: &StrategyConfig, state: &LoopState, account: &PositionAccount, price: Decimal, now: NaiveDateTime) -> Decision {
        let bars = falling_bars(now.date());
        engine().evaluate(&DecisionInput {
            config,
            bars: &bars,
            benchmark_bars: &[],
            yesterday_volume: Some(1000.0),
            price,
            now,
            state,
            account,
        })
    }

    #[test]
    fn test_not_ready_with_short_history() {
        let config = StrategyConfig::new("600519");
        let bars = falling_bars(day(1));
        let decision = engine().evaluate(&DecisionInput {
            config: &config,
            bars: &bars[..40],
            benchmark_bars: &[],
            yesterday_volume: None,
            price: Decimal::TEN,
            now: day(1).and_hms_opt(10, 10, 0).unwrap(),
            state: &LoopState::Flat,
            account: &PositionAccount::default(),
        });
        assert_eq!(decision.verdict, Verdict::NotReady);
        assert!(decision.score.is_none());
    }

    #[test]
    fn test_percentage_sell_first_sized() {
        let config = StrategyConfig::new("600519")
            .with_strategy(StrategyKind::Percentage)
            .with_market_filter(false)
            .with_share_caps(None, Some(250));
        let mut bars = falling_bars(day(1));
        // yesterday's close at 10.00
        bars.insert(0, Bar { timestamp: day(1).and_hms_opt(9, 0, 0).unwrap() - Duration::days(1), ..bars[0] });
        let decision = engine().evaluate(&DecisionInput {
            config: &config,
            bars: &bars,
            benchmark_bars: &[],
            yesterday_volume: None,
            price: Decimal::new(1010, 2),
            now: day(1).and_hms_opt(10, 30, 0).unwrap(),
            state: &LoopState::Flat,
            account: &PositionAccount::default(),
        });
        assert_eq!(decision.signal, Signal::Sell);
        let order = decision.planned_order().unwrap();
        assert_eq!(order.volume, 200);
        assert_eq!(order.closes_loop, None);
        assert_eq!(decision.regime, Some(Regime::Normal));
    }

    #[test]
    fn test_pending_loop_rejects_opening_side() {
        let config = StrategyConfig::new("600519").with_strategy(StrategyKind::Percentage).with_market_filter(false);
        let now = day(1).and_hms_opt(10, 30, 0).unwrap();
        let open = TradeLoop::open("600519", Direction::BuyFirst, Decimal::new(1050, 2), 100, now - Duration::minutes(20));
        let state = LoopState::PendingClose(open);

        // 9.50 is well below the open price: percentage says buy more
        let decision = evaluate(&config, &state, &PositionAccount::default(), Decimal::new(950, 2), now);
        assert_eq!(decision.signal, Signal::Buy);
        assert_eq!(decision.verdict, Verdict::Rejected);
        assert!(decision.reason.starts_with("closed-loop lock: only closing signals accepted"));
    }

    #[test]
    fn test_sell_close_dropped_when_available_below_lot() {
        let config = StrategyConfig::new("600519").with_strategy(StrategyKind::Percentage).with_market_filter(false);
        let now = day(1).and_hms_opt(10, 30, 0).unwrap();
        let open = TradeLoop::open("600519", Direction::BuyFirst, Decimal::new(900, 2), 300, now - Duration::minutes(20));
        let account = PositionAccount { available_shares: 50, ..PositionAccount::default() };

        let decision = evaluate(&config, &LoopState::PendingClose(open), &account, Decimal::new(950, 2), now);
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.verdict, Verdict::Dropped);
    }

    #[test]
    fn test_same_input_same_decision() {
        let config = StrategyConfig::new("600519");
        let now = day(1).and_hms_opt(10, 30, 0).unwrap();
        let a = evaluate(&config, &LoopState::Flat, &PositionAccount::default(), Decimal::new(950, 2), now);
        let b = evaluate(&config, &LoopState::Flat, &PositionAccount::default(), Decimal::new(950, 2), now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_context() {
        let bars = falling_bars(day(1));
        let ctx = session_context(&bars, day(1).and_hms_opt(11, 0, 0).unwrap());
        assert_eq!(ctx.prev_close, None);
        assert_eq!(ctx.day_open, 10.0);
        assert_eq!(ctx.day_low, 9.45);

        let next = session_context(&bars, day(4).and_hms_opt(9, 31, 0).unwrap());
        assert_eq!(next.prev_close, Some(9.5));
        assert_eq!(next.day_high, 0.0);
    }
}
