//! Historical replay
//!
//! Drives the decision engine bar by bar over a stored series. Orders fill
//! immediately at the bar close, so the lock never stays held between bars.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::engine::{DecisionEngine, DecisionInput};
use crate::indicators::IndicatorParams;
use crate::portfolio::{AccountSnapshot, PositionAccount};
use crate::settings::RunnerSettings;
use crate::trade_loop::{LoopState, TradeLoop, Transition};
use crate::types::{price_to_decimal, Bar, Fill, Result, TradeRecord};

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub instrument: String,
    pub decisions: usize,
    pub trades: Vec<TradeRecord>,
    pub closed_loops: Vec<TradeLoop>,
    pub open_loop: Option<TradeLoop>,
    pub realized_profit: Decimal,
    pub final_account: PositionAccount,
    pub final_snapshot: Option<AccountSnapshot>,
    /// Most loops ever open at once
    pub max_open_loops: usize,
}

pub fn replay(
    config: &StrategyConfig,
    bars: &[Bar],
    benchmark: &[Bar],
    account: PositionAccount,
    settings: &RunnerSettings,
) -> Result<ReplaySummary> {
    config.validate()?;
    let engine = DecisionEngine::new(
        IndicatorParams::default(),
        settings.benchmark_bar_minutes,
        settings.lot_size,
    );

    let mut account = account;
    let mut state = LoopState::Flat;
    let mut trades = Vec::new();
    let mut closed_loops: Vec<TradeLoop> = Vec::new();
    let mut decisions = 0;
    let mut max_open_loops = 0;

    for (i, bar) in bars.iter().enumerate() {
        let Some(price) = price_to_decimal(bar.close) else {
            continue;
        };
        let window = &bars[(i + 1).saturating_sub(settings.lookback_bars)..=i];
        let benchmark_end = benchmark.partition_point(|b| b.timestamp <= bar.timestamp);
        let benchmark_window =
            &benchmark[benchmark_end.saturating_sub(settings.benchmark_lookback_bars)..benchmark_end];

        account.roll_session(bar.timestamp.date());
        let decision = engine.evaluate(&DecisionInput {
            config,
            bars: window,
            benchmark_bars: benchmark_window,
            yesterday_volume: None,
            price,
            now: bar.timestamp,
            state: &state,
            account: &account,
        });
        decisions += 1;

        let Some(order) = decision.planned_order() else {
            continue;
        };
        debug!("Replay {} {}: {}", bar.timestamp, decision.signal, decision.reason);

        let fill = Fill {
            order_id: Uuid::new_v4(),
            instrument: config.instrument.clone(),
            side: order.side,
            price: order.price,
            volume: order.volume,
            timestamp: bar.timestamp,
        };
        account.validate_fill(&fill)?;
        let transition = state.apply_fill(&fill)?;
        account.apply_fill(&fill)?;

        let loop_id = match &transition {
            Transition::Opened(l) | Transition::Closed(l) => l.id,
        };
        trades.push(TradeRecord {
            id: Uuid::new_v4(),
            order_id: fill.order_id,
            instrument: fill.instrument.clone(),
            side: fill.side,
            price: fill.price,
            volume: fill.volume,
            amount: fill.price * Decimal::from(fill.volume),
            timestamp: fill.timestamp,
            loop_id,
        });
        if let Transition::Closed(closed) = transition {
            closed_loops.push(closed);
        }
        max_open_loops = max_open_loops.max(usize::from(state.open_loop().is_some()));
    }

    let realized_profit: Decimal = closed_loops.iter().filter_map(|l| l.profit).sum();
    let final_snapshot = bars
        .last()
        .and_then(|b| price_to_decimal(b.close))
        .map(|price| account.snapshot(price));

    info!(
        "Replay {}: {} bars, {} trades, {} closed loops, realized {}",
        config.instrument,
        bars.len(),
        trades.len(),
        closed_loops.len(),
        realized_profit
    );

    Ok(ReplaySummary {
        instrument: config.instrument.clone(),
        decisions,
        trades,
        closed_loops,
        open_loop: state.open_loop().cloned(),
        realized_profit,
        final_account: account,
        final_snapshot,
        max_open_loops,
    })
}
