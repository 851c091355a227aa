//! Market regime classifier
//!
//! Reads the benchmark index frame and produces a bounded sentiment score,
//! a coarse regime and the factor score an entry must reach. Only completed
//! benchmark bars are used; a stale or short frame falls back to neutral.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::bars::floor_to_bar;
use crate::indicators::{FeatureFrame, FeatureRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Strong,
    Normal,
    Weak,
    Danger,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Regime::Strong => "strong",
            Regime::Normal => "normal",
            Regime::Weak => "weak",
            Regime::Danger => "danger",
        };
        write!(f, "{}", name)
    }
}

/// Classifier output for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub regime: Regime,
    pub sentiment: f64,
    pub required_score: f64,
    pub allow_entry: bool,
    pub reason: String,
}

/// Weights used for the available history depth
#[derive(Debug, Clone, Copy, PartialEq)]
struct ModeWeights {
    overbought: f64,
    oversold: f64,
    vwap_strong: f64,
    vwap_mild: f64,
    rsi_weight: f64,
}

const FULL_MODE: ModeWeights = ModeWeights {
    overbought: 60.0,
    oversold: 40.0,
    vwap_strong: 0.30,
    vwap_mild: 0.15,
    rsi_weight: 0.25,
};

const EARLY_MODE: ModeWeights = ModeWeights {
    overbought: 70.0,
    oversold: 30.0,
    vwap_strong: 0.40,
    vwap_mild: 0.20,
    rsi_weight: 0.15,
};

/// Classifier settings
#[derive(Debug, Clone, Copy)]
pub struct RegimeClassifier {
    bar_minutes: u32,
    max_age: Duration,
    full_mode_bars: usize,
    early_mode_bars: usize,
}

impl RegimeClassifier {
    pub fn new(bar_minutes: u32) -> Self {
        Self {
            bar_minutes: bar_minutes.max(1),
            max_age: Duration::minutes(10),
            full_mode_bars: 14,
            early_mode_bars: 6,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Assess the regime at `now`.
    ///
    /// `benchmark` is `None` when the benchmark frame is not ready yet.
    pub fn assess(
        &self,
        benchmark: Option<&FeatureFrame>,
        now: NaiveDateTime,
        instrument_weak: bool,
        early_session_until: NaiveTime,
    ) -> RegimeAssessment {
        let neutral = |reason: String| RegimeAssessment {
            regime: Regime::Normal,
            sentiment: 0.0,
            required_score: if instrument_weak { 0.60 } else { 0.55 },
            allow_entry: true,
            reason,
        };

        let Some(frame) = benchmark else {
            return neutral("benchmark not ready, neutral".to_string());
        };

        let completed = floor_to_bar(now, self.bar_minutes) - Duration::minutes(i64::from(self.bar_minutes));
        let Some(row) = frame.last_at_or_before(completed) else {
            return neutral("no completed benchmark bar, neutral".to_string());
        };

        let age = now - row.timestamp;
        if age > self.max_age {
            debug!("Benchmark bar {} is stale ({}m old)", row.timestamp, age.num_minutes());
            return neutral(format!("benchmark stale by {}m, neutral", age.num_minutes()));
        }

        let completed_bars = row.bar_index + 1;
        let Some(sentiment) = self.sentiment(row, completed_bars) else {
            return neutral(format!("{} completed benchmark bars, degraded", completed_bars));
        };

        classify(sentiment, instrument_weak, now.time(), early_session_until)
    }

    /// Weighted sentiment in [-1, 1], or `None` in degraded mode
    fn sentiment(&self, row: &FeatureRow, completed_bars: usize) -> Option<f64> {
        let (weights, rsi) = if completed_bars >= self.full_mode_bars && row.rsi_long.is_some() {
            (FULL_MODE, row.rsi_long)
        } else if completed_bars >= self.early_mode_bars {
            (EARLY_MODE, Some(row.rsi_short))
        } else {
            return None;
        };

        let mut sentiment: f64 = 0.0;

        let dev = row.vwap_deviation;
        sentiment += if dev > 0.005 {
            weights.vwap_strong
        } else if dev > 0.0 {
            weights.vwap_mild
        } else if dev < -0.005 {
            -weights.vwap_strong
        } else {
            -weights.vwap_mild
        };

        if let Some(rsi) = rsi {
            let w = weights.rsi_weight;
            sentiment += if rsi > weights.overbought {
                w
            } else if rsi > 50.0 {
                w / 2.0
            } else if rsi < weights.oversold {
                -w
            } else {
                -w / 2.0
            };
        }

        if let Some(slope) = row.ma20_slope {
            if row.close > 0.0 {
                let normalized = slope / row.close;
                sentiment += if normalized > 0.002 {
                    0.25
                } else if normalized > 0.0 {
                    0.10
                } else if normalized < -0.002 {
                    -0.25
                } else {
                    -0.10
                };
            }
        }

        let change = row.change_pct;
        sentiment += if change > 0.01 {
            0.20
        } else if change > 0.005 {
            0.10
        } else if change < -0.01 {
            -0.20
        } else if change < -0.005 {
            -0.10
        } else {
            0.0
        };

        Some(sentiment.clamp(-1.0, 1.0))
    }
}

/// Map sentiment to a regime. Lower bounds are inclusive.
pub fn classify(
    sentiment: f64,
    instrument_weak: bool,
    time: NaiveTime,
    early_session_until: NaiveTime,
) -> RegimeAssessment {
    let (regime, required_score, allow_entry) = if sentiment >= 0.4 {
        (Regime::Strong, 0.50, true)
    } else if sentiment >= 0.1 {
        (Regime::Normal, if instrument_weak { 0.60 } else { 0.55 }, true)
    } else if sentiment >= -0.2 {
        (Regime::Weak, if time < early_session_until { 0.70 } else { 0.65 }, true)
    } else {
        (Regime::Danger, 1.0, false)
    };

    RegimeAssessment {
        regime,
        sentiment,
        required_score,
        allow_entry,
        reason: format!("{} market (sentiment {:.2}), need {:.2}", regime, sentiment, required_score),
    }
}

/// Assessment used when the market filter is switched off
pub fn filter_disabled() -> RegimeAssessment {
    RegimeAssessment {
        regime: Regime::Normal,
        sentiment: 0.0,
        required_score: 0.55,
        allow_entry: true,
        reason: "market filter disabled".to_string(),
    }
}
