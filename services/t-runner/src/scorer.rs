//! Factor scorer
//!
//! Reduces one feature row to an entry-desirability score. Each factor is
//! tiered and capped on its own; the composite is their plain sum and is
//! only ever compared against a required threshold.

use serde::{Deserialize, Serialize};

use crate::indicators::FeatureRow;

/// Ceiling of the volume factor
pub const VOLUME_CAP: f64 = 0.15;

/// Individual factor contributions
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub vwap_deviation: f64,
    pub intraday_position: f64,
    pub vwap_change: f64,
    pub trend: f64,
    pub rsi: f64,
    pub volume: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.vwap_deviation + self.intraday_position + self.vwap_change + self.trend + self.rsi + self.volume
    }
}

pub fn score(row: &FeatureRow) -> ScoreBreakdown {
    ScoreBreakdown {
        vwap_deviation: vwap_deviation_score(row.vwap_deviation),
        intraday_position: position_score(row.intraday_position),
        vwap_change: vwap_change_score(row.vwap_change),
        trend: trend_score(row),
        rsi: rsi_score(row),
        volume: volume_score(row),
    }
}

fn vwap_deviation_score(deviation: f64) -> f64 {
    if deviation < -0.02 {
        0.25
    } else if deviation < -0.01 {
        0.20
    } else if deviation < 0.0 {
        0.10
    } else {
        0.0
    }
}

fn position_score(position: f64) -> f64 {
    if position < 0.15 {
        0.20
    } else if position < 0.30 {
        0.15
    } else if position < 0.50 {
        0.05
    } else {
        0.0
    }
}

/// A gently falling VWAP is the preferred pullback; a flat one is neutral-good
fn vwap_change_score(change: Option<f64>) -> f64 {
    match change {
        None => 0.05,
        Some(c) if c > -0.02 && c < -0.005 => 0.15,
        Some(c) if c.abs() < 0.002 => 0.10,
        Some(_) => 0.0,
    }
}

fn trend_score(row: &FeatureRow) -> f64 {
    if row.ma20.map(|ma| row.close > ma).unwrap_or(false) {
        0.15
    } else if row.close > row.ma5 {
        0.08
    } else {
        0.0
    }
}

fn rsi_score(row: &FeatureRow) -> f64 {
    let short_low = row.rsi_short < row.rsi_short_threshold;
    let long_low = row.rsi_long.map(|r| r < row.rsi_long_threshold).unwrap_or(false);
    match (short_low, long_low) {
        (true, true) => 0.15,
        (true, false) | (false, true) => 0.08,
        (false, false) => 0.0,
    }
}

fn volume_score(row: &FeatureRow) -> f64 {
    let mut score: f64 = 0.0;

    if row.yesterday_volume > 0.0 {
        let ratio = row.volume / row.yesterday_volume;
        score += if ratio > 2.0 {
            0.05
        } else if ratio > 1.5 {
            0.04
        } else if ratio > 1.2 {
            0.03
        } else {
            0.02
        };
        // heavy volume into a sharp drop
        if ratio > 1.5 && row.change_pct < -0.02 {
            score += 0.02;
        }
    }

    if row.intraday_avg_volume > 0.0 {
        let ratio = row.volume / row.intraday_avg_volume;
        score += if ratio > 1.5 {
            0.03
        } else if ratio > 1.0 {
            0.02
        } else {
            0.01
        };
    }

    score += match row.volume_up_count {
        n if n >= 4 => 0.02,
        3 => 0.01,
        _ => 0.0,
    };

    score.min(VOLUME_CAP)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn neutral_row() -> FeatureRow {
        FeatureRow {
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 30, 0).unwrap(),
            bar_index: 59,
            close: 10.0,
            volume: 1000.0,
            vwap: 10.0,
            vwap_deviation: 0.0,
            vwap_change: Some(0.01),
            intraday_position: 0.6,
            ma5: 10.0,
            ma20: Some(10.0),
            ma20_slope: Some(0.0),
            is_weak_market: false,
            rsi_short: 50.0,
            rsi_long: Some(50.0),
            rsi_short_threshold: 30.0,
            rsi_long_threshold: 40.0,
            atr_pct: Some(0.005),
            atr_multiplier: 1.5,
            dynamic_profit_target: Some(0.010),
            change_pct: 0.0,
            volume_up_count: 0,
            yesterday_volume: 1000.0,
            intraday_avg_volume: 1000.0,
        }
    }

    #[test]
    fn test_oversold_pullback_hits_top_tiers() {
        let row = FeatureRow {
            vwap_deviation: -0.025,
            intraday_position: 0.10,
            rsi_short: 20.0,
            rsi_long: Some(30.0),
            ..neutral_row()
        };
        let breakdown = score(&row);
        assert_eq!(breakdown.vwap_deviation, 0.25);
        assert_eq!(breakdown.intraday_position, 0.20);
        assert_eq!(breakdown.rsi, 0.15);
    }

    #[test]
    fn test_rsi_half_when_one_window_low() {
        let row = FeatureRow { rsi_short: 20.0, ..neutral_row() };
        assert_eq!(score(&row).rsi, 0.08);

        let row = FeatureRow { rsi_long: None, rsi_short: 20.0, ..neutral_row() };
        assert_eq!(score(&row).rsi, 0.08);
    }

    #[test]
    fn test_volume_blend_within_cap() {
        let row = FeatureRow {
            volume: 5000.0,
            yesterday_volume: 1000.0,
            intraday_avg_volume: 1000.0,
            change_pct: -0.03,
            volume_up_count: 5,
            ..neutral_row()
        };
        let volume = score(&row).volume;
        assert!((volume - 0.12).abs() < 1e-12);
        assert!(volume <= VOLUME_CAP);

        let quiet = FeatureRow { volume: 500.0, ..neutral_row() };
        assert!((score(&quiet).volume - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_vwap_change_tiers() {
        assert_eq!(vwap_change_score(None), 0.05);
        assert_eq!(vwap_change_score(Some(-0.01)), 0.15);
        assert_eq!(vwap_change_score(Some(0.001)), 0.10);
        assert_eq!(vwap_change_score(Some(-0.03)), 0.0);
    }

    #[test]
    fn test_score_never_negative() {
        let row = FeatureRow {
            vwap_deviation: 0.05,
            intraday_position: 1.0,
            vwap_change: Some(0.05),
            close: 9.0,
            yesterday_volume: 0.0,
            intraday_avg_volume: 0.0,
            ..neutral_row()
        };
        let breakdown = score(&row);
        assert_eq!(breakdown.total(), 0.0);
    }
}
