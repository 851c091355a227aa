//! Indicator pipeline
//!
//! Turns a bar window into a [`FeatureFrame`]. Everything here is a pure
//! function of the input bars: the same window always produces the same rows.
//!
//! Intraday values (VWAP, day high/low, average volume) are running values
//! that reset at each calendar-day boundary, so a row never looks ahead.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Bar;

const RSI_EPSILON: f64 = 1e-9;

/// Window lengths and thresholds for the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParams {
    /// Minimum usable bars for an instrument frame
    pub min_bars: usize,
    /// Minimum usable bars for a benchmark frame
    pub benchmark_min_bars: usize,
    /// Bars at or below this volume are dropped as illiquid prints
    pub min_volume: f64,
    pub rsi_short: usize,
    pub rsi_long: usize,
    pub atr_period: usize,
    pub atr_median_window: usize,
    /// Lag for MA20 slope and VWAP change
    pub slope_lag: usize,
    pub volume_trend_window: usize,
    pub base_profit_target: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            min_bars: 50,
            benchmark_min_bars: 6,
            min_volume: 100.0,
            rsi_short: 6,
            rsi_long: 14,
            atr_period: 14,
            atr_median_window: 60,
            slope_lag: 5,
            volume_trend_window: 5,
            base_profit_target: 0.010,
        }
    }
}

impl IndicatorParams {
    pub fn with_base_profit_target(mut self, target: f64) -> Self {
        self.base_profit_target = target;
        self
    }
}

/// Derived attributes for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: NaiveDateTime,
    /// Position of the bar in the filtered window (0-based)
    pub bar_index: usize,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    /// close / vwap - 1
    pub vwap_deviation: f64,
    /// VWAP change over `slope_lag` bars inside the same day
    pub vwap_change: Option<f64>,
    pub intraday_position: f64,
    pub ma5: f64,
    pub ma20: Option<f64>,
    pub ma20_slope: Option<f64>,
    pub is_weak_market: bool,
    pub rsi_short: f64,
    pub rsi_long: Option<f64>,
    pub rsi_short_threshold: f64,
    pub rsi_long_threshold: f64,
    pub atr_pct: Option<f64>,
    pub atr_multiplier: f64,
    pub dynamic_profit_target: Option<f64>,
    pub change_pct: f64,
    pub volume_up_count: u32,
    pub yesterday_volume: f64,
    pub intraday_avg_volume: f64,
}

/// Ordered feature rows for one instrument
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureFrame {
    rows: Vec<FeatureRow>,
}

impl FeatureFrame {
    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn latest(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Last row whose bar started at or before `ts`
    pub fn last_at_or_before(&self, ts: NaiveDateTime) -> Option<&FeatureRow> {
        let idx = self.rows.partition_point(|r| r.timestamp <= ts);
        idx.checked_sub(1).map(|i| &self.rows[i])
    }
}

/// Not enough history for a usable frame. Callers skip the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotReady {
    pub have: usize,
    pub need: usize,
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "insufficient bars: have {}, need {}", self.have, self.need)
    }
}

/// Full feature frame for a traded instrument
pub fn compute(
    bars: &[Bar],
    yesterday_volume: Option<f64>,
    params: &IndicatorParams,
) -> Result<FeatureFrame, NotReady> {
    compute_with_minimum(bars, yesterday_volume, params, params.min_bars)
}

/// Reduced frame for the benchmark index. Only close, VWAP, short RSI and
/// change are required of each row.
pub fn compute_benchmark(bars: &[Bar], params: &IndicatorParams) -> Result<FeatureFrame, NotReady> {
    compute_with_minimum(bars, None, params, params.benchmark_min_bars)
}

fn compute_with_minimum(
    bars: &[Bar],
    yesterday_volume: Option<f64>,
    params: &IndicatorParams,
    min_bars: usize,
) -> Result<FeatureFrame, NotReady> {
    let bars: Vec<Bar> = bars
        .iter()
        .filter(|b| b.volume > params.min_volume && b.high > 0.0)
        .copied()
        .collect();

    if bars.len() < min_bars {
        return Err(NotReady { have: bars.len(), need: min_bars });
    }

    let rows = build_rows(&bars, yesterday_volume, params);
    if rows.is_empty() {
        // Enough bars overall but none with a defined short RSI yet
        return Err(NotReady { have: bars.len(), need: params.rsi_short + 1 });
    }
    Ok(FeatureFrame { rows })
}

fn build_rows(bars: &[Bar], yesterday_volume: Option<f64>, params: &IndicatorParams) -> Vec<FeatureRow> {
    let n = bars.len();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let session = SessionStats::compute(bars);
    let prior_session_volume = prior_session_mean_volume(bars);

    let ma5: Vec<Option<f64>> = (0..n).map(|i| rolling_mean(&closes, i, 5)).collect();
    let ma20: Vec<Option<f64>> = (0..n).map(|i| rolling_mean(&closes, i, 20)).collect();

    let mut gains = vec![None; n];
    let mut losses = vec![None; n];
    for i in 1..n {
        let delta = closes[i] - closes[i - 1];
        gains[i] = Some(delta.max(0.0));
        losses[i] = Some((-delta).max(0.0));
    }
    let rsi = |i: usize, window: usize| -> Option<f64> {
        let gain = rolling_mean_opt(&gains, i, window)?;
        let loss = rolling_mean_opt(&losses, i, window)?;
        Some(100.0 - 100.0 / (1.0 + gain / (loss + RSI_EPSILON)))
    };

    let true_range: Vec<Option<f64>> = (0..n)
        .map(|i| {
            let bar = &bars[i];
            let range = bar.high - bar.low;
            Some(match i.checked_sub(1).map(|p| closes[p]) {
                Some(prev) => range.max((bar.high - prev).abs()).max((bar.low - prev).abs()),
                None => range,
            })
        })
        .collect();
    let atr_pct: Vec<Option<f64>> = (0..n)
        .map(|i| {
            let atr = rolling_mean_opt(&true_range, i, params.atr_period)?;
            (closes[i] > 0.0).then(|| atr / closes[i])
        })
        .collect();

    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        // Short RSI, change and MA5 are required of every row
        let (Some(rsi_short), Some(ma5_value)) = (rsi(i, params.rsi_short), ma5[i]) else {
            continue;
        };

        let bar = &bars[i];
        let vwap = session.vwap[i];

        let ma20_slope = match (ma20[i], i.checked_sub(params.slope_lag).and_then(|p| ma20[p])) {
            (Some(now), Some(then)) => Some(now - then),
            _ => None,
        };
        let is_weak_market = ma20_slope.map(|s| s < 0.0).unwrap_or(false);
        let rsi_short_threshold = if is_weak_market { 25.0 } else { 30.0 };

        let vwap_change = i
            .checked_sub(params.slope_lag)
            .filter(|&p| bars[p].timestamp.date() == bar.timestamp.date() && session.vwap[p] > 0.0)
            .map(|p| vwap / session.vwap[p] - 1.0);

        let atr_multiplier = atr_multiplier(&atr_pct, i, params.atr_median_window);
        let dynamic_profit_target =
            atr_pct[i].map(|a| params.base_profit_target.max(a * atr_multiplier));

        let window_start = i.saturating_sub(params.volume_trend_window.saturating_sub(1)).max(1);
        let volume_up_count = (window_start..=i)
            .filter(|&j| volumes[j] > volumes[j - 1])
            .count() as u32;

        let intraday_avg_volume = session.avg_volume[i];
        let yesterday_volume = yesterday_volume
            .filter(|v| *v > 0.0)
            .or_else(|| prior_session_volume.get(&bar.timestamp.date()).copied())
            .unwrap_or(intraday_avg_volume);

        rows.push(FeatureRow {
            timestamp: bar.timestamp,
            bar_index: i,
            close: bar.close,
            volume: bar.volume,
            vwap,
            vwap_deviation: if vwap > 0.0 { bar.close / vwap - 1.0 } else { 0.0 },
            vwap_change,
            intraday_position: session.position[i],
            ma5: ma5_value,
            ma20: ma20[i],
            ma20_slope,
            is_weak_market,
            rsi_short,
            rsi_long: rsi(i, params.rsi_long),
            rsi_short_threshold,
            rsi_long_threshold: rsi_short_threshold + 10.0,
            atr_pct: atr_pct[i],
            atr_multiplier,
            dynamic_profit_target,
            change_pct: bar.close / closes[i - 1] - 1.0,
            volume_up_count,
            yesterday_volume,
            intraday_avg_volume,
        });
    }
    rows
}

/// Running per-day VWAP, position in the day's range and average volume
struct SessionStats {
    vwap: Vec<f64>,
    position: Vec<f64>,
    avg_volume: Vec<f64>,
}

impl SessionStats {
    fn compute(bars: &[Bar]) -> Self {
        let mut vwap = Vec::with_capacity(bars.len());
        let mut position = Vec::with_capacity(bars.len());
        let mut avg_volume = Vec::with_capacity(bars.len());

        let mut day: Option<NaiveDate> = None;
        let (mut cum_amount, mut cum_volume, mut count) = (0.0, 0.0, 0usize);
        let (mut day_high, mut day_low) = (f64::MIN, f64::MAX);

        for bar in bars {
            let date = bar.timestamp.date();
            if day != Some(date) {
                day = Some(date);
                cum_amount = 0.0;
                cum_volume = 0.0;
                count = 0;
                day_high = f64::MIN;
                day_low = f64::MAX;
            }

            let amount = if bar.amount > 0.0 { bar.amount } else { bar.close * bar.volume };
            cum_amount += amount;
            cum_volume += bar.volume;
            count += 1;
            day_high = day_high.max(bar.high);
            day_low = day_low.min(bar.low);

            vwap.push(if cum_volume > 0.0 { cum_amount / cum_volume } else { bar.close });

            let range = day_high - day_low;
            position.push(if range > 0.0 {
                ((bar.close - day_low) / range).clamp(0.0, 1.0)
            } else {
                0.5
            });

            avg_volume.push(cum_volume / count as f64);
        }

        Self { vwap, position, avg_volume }
    }
}

/// Mean bar volume of the session preceding each date in the window
fn prior_session_mean_volume(bars: &[Bar]) -> BTreeMap<NaiveDate, f64> {
    let mut per_day: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for bar in bars {
        let entry = per_day.entry(bar.timestamp.date()).or_insert((0.0, 0));
        entry.0 += bar.volume;
        entry.1 += 1;
    }

    let mut prior = BTreeMap::new();
    let mut previous: Option<f64> = None;
    for (date, (total, count)) in per_day {
        if let Some(mean) = previous {
            prior.insert(date, mean);
        }
        previous = Some(total / count as f64);
    }
    prior
}

fn atr_multiplier(atr_pct: &[Option<f64>], i: usize, window: usize) -> f64 {
    const MID: f64 = 1.5;
    let Some(current) = atr_pct[i] else {
        return MID;
    };
    let start = (i + 1).saturating_sub(window);
    let mut values: Vec<f64> = atr_pct[start..=i].iter().flatten().copied().collect();
    let Some(median) = median(&mut values) else {
        return MID;
    };

    if current < median * 0.8 {
        1.3
    } else if current > median * 1.2 {
        1.8
    } else {
        MID
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn rolling_mean(values: &[f64], i: usize, window: usize) -> Option<f64> {
    if window == 0 || i + 1 < window {
        return None;
    }
    let slice = &values[i + 1 - window..=i];
    Some(slice.iter().sum::<f64>() / window as f64)
}

fn rolling_mean_opt(values: &[Option<f64>], i: usize, window: usize) -> Option<f64> {
    if window == 0 || i + 1 < window {
        return None;
    }
    let mut sum = 0.0;
    for value in &values[i + 1 - window..=i] {
        sum += (*value)?;
    }
    Some(sum / window as f64)
}
