//! Per-instrument bar series

use chrono::{Duration, NaiveDateTime, Timelike};
use std::collections::BTreeMap;

use crate::types::{Bar, Tick};

/// Bars keyed by timestamp, bounded to a fixed lookback
#[derive(Debug, Clone)]
pub struct BarSeries {
    bars: BTreeMap<NaiveDateTime, Bar>,
    lookback: usize,
    bar_minutes: u32,
}

impl BarSeries {
    pub fn new(lookback: usize, bar_minutes: u32) -> Self {
        Self {
            bars: BTreeMap::new(),
            lookback: lookback.max(1),
            bar_minutes: bar_minutes.max(1),
        }
    }

    pub fn from_bars(bars: impl IntoIterator<Item = Bar>, lookback: usize, bar_minutes: u32) -> Self {
        let mut series = Self::new(lookback, bar_minutes);
        for bar in bars {
            series.upsert(bar);
        }
        series
    }

    /// Insert a bar; a duplicate timestamp replaces the earlier bar
    pub fn upsert(&mut self, bar: Bar) {
        self.bars.insert(bar.timestamp, bar);
        while self.bars.len() > self.lookback {
            self.bars.pop_first();
        }
    }

    /// Fold a quote snapshot in as the bar for its interval
    pub fn apply_tick(&mut self, tick: &Tick) {
        let timestamp = floor_to_bar(tick.timestamp, self.bar_minutes);
        self.upsert(Bar {
            timestamp,
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            volume: tick.volume,
            amount: tick.amount,
        });
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.values().next_back()
    }

    pub fn to_vec(&self) -> Vec<Bar> {
        self.bars.values().copied().collect()
    }

    pub fn bar_minutes(&self) -> u32 {
        self.bar_minutes
    }
}

/// Floor a timestamp to the start of its bar interval
pub fn floor_to_bar(ts: NaiveDateTime, bar_minutes: u32) -> NaiveDateTime {
    let bar_minutes = bar_minutes.max(1);
    let minute_of_day = ts.hour() * 60 + ts.minute();
    let floored = minute_of_day - minute_of_day % bar_minutes;
    ts.date().and_hms_opt(0, 0, 0).unwrap_or(ts) + Duration::minutes(i64::from(floored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn bar(at: NaiveDateTime, close: f64) -> Bar {
        Bar { timestamp: at, open: close, high: close, low: close, close, volume: 1000.0, amount: 0.0 }
    }

    #[test]
    fn test_duplicate_timestamp_last_write_wins() {
        let mut series = BarSeries::new(10, 1);
        series.upsert(bar(ts(9, 30, 0), 10.0));
        series.upsert(bar(ts(9, 30, 0), 10.5));
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().close, 10.5);
    }

    #[test]
    fn test_lookback_trims_oldest() {
        let mut series = BarSeries::new(2, 1);
        series.upsert(bar(ts(9, 30, 0), 1.0));
        series.upsert(bar(ts(9, 31, 0), 2.0));
        series.upsert(bar(ts(9, 32, 0), 3.0));
        let closes: Vec<f64> = series.to_vec().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![2.0, 3.0]);
    }

    #[test]
    fn test_floor_to_bar() {
        assert_eq!(floor_to_bar(ts(10, 7, 42), 5), ts(10, 5, 0));
        assert_eq!(floor_to_bar(ts(10, 7, 42), 1), ts(10, 7, 0));
    }
}
