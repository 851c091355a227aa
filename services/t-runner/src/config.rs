//! Strategy Configuration
//!
//! One explicit [`StrategyConfig`] per instrument. Values may change between
//! evaluations; a single evaluation always works on one snapshot.

use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{Result, RunnerError};

/// Per-instrument strategy configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StrategyConfig {
    pub instrument: String,
    /// When false the runner still evaluates and reports, but never submits
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Per-order share cap for buys
    #[serde(default)]
    pub buy_shares: Option<u64>,
    /// Per-order share cap for sells
    #[serde(default)]
    pub sell_shares: Option<u64>,
    /// Per-order notional cap for buys
    #[serde(default)]
    pub max_order_amount: Option<Decimal>,
    #[serde(default = "default_true")]
    pub market_filter_enabled: bool,
    #[serde(default = "default_no_new_entry_after")]
    pub no_new_entry_after: NaiveTime,
    /// Earlier opening cutoff when the instrument's own trend is down
    #[serde(default = "default_weak_stock_entry_cutoff")]
    pub weak_stock_entry_cutoff: NaiveTime,
    /// Earlier opening cutoff when the benchmark regime is weak
    #[serde(default = "default_weak_market_entry_cutoff")]
    pub weak_market_entry_cutoff: NaiveTime,
    #[serde(default = "default_force_close_at")]
    pub force_close_at: NaiveTime,
    /// Before this time a weak regime demands a higher score
    #[serde(default = "default_early_session_until")]
    pub early_session_until: NaiveTime,
    /// Percent below a sell-first open price that closes it overnight
    #[serde(default = "default_overnight_ratio")]
    pub overnight_buy_ratio: Decimal,
    /// Percent above a buy-first open price that closes it overnight
    #[serde(default = "default_overnight_ratio")]
    pub overnight_sell_ratio: Decimal,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_base_profit_target")]
    pub base_profit_target: f64,
    #[serde(default)]
    pub percentage: PercentageParams,
    #[serde(default)]
    pub grid: GridParams,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    MultiFactor,
    Percentage,
    Grid,
}

/// Thresholds for the percentage strategy, in percent of the previous close
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PercentageParams {
    #[serde(default = "default_pct_threshold")]
    pub buy_threshold_pct: f64,
    #[serde(default = "default_pct_threshold")]
    pub sell_threshold_pct: f64,
}

impl Default for PercentageParams {
    fn default() -> Self {
        Self {
            buy_threshold_pct: default_pct_threshold(),
            sell_threshold_pct: default_pct_threshold(),
        }
    }
}

/// Grid layout bounds
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct GridParams {
    #[serde(default = "default_grid_min_cells")]
    pub min_cells: u32,
    #[serde(default = "default_grid_max_cells")]
    pub max_cells: u32,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            min_cells: default_grid_min_cells(),
            max_cells: default_grid_max_cells(),
        }
    }
}

impl StrategyConfig {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            active: true,
            strategy: StrategyKind::default(),
            buy_shares: None,
            sell_shares: None,
            max_order_amount: None,
            market_filter_enabled: true,
            no_new_entry_after: default_no_new_entry_after(),
            weak_stock_entry_cutoff: default_weak_stock_entry_cutoff(),
            weak_market_entry_cutoff: default_weak_market_entry_cutoff(),
            force_close_at: default_force_close_at(),
            early_session_until: default_early_session_until(),
            overnight_buy_ratio: default_overnight_ratio(),
            overnight_sell_ratio: default_overnight_ratio(),
            stop_loss_pct: default_stop_loss_pct(),
            base_profit_target: default_base_profit_target(),
            percentage: PercentageParams::default(),
            grid: GridParams::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_market_filter(mut self, enabled: bool) -> Self {
        self.market_filter_enabled = enabled;
        self
    }

    pub fn with_share_caps(mut self, buy: Option<u64>, sell: Option<u64>) -> Self {
        self.buy_shares = buy;
        self.sell_shares = sell;
        self
    }

    /// Reject malformed values before they reach the decision path
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RunnerError::Validation(format!("{}: {}", self.instrument, msg)));

        if self.instrument.trim().is_empty() {
            return Err(RunnerError::Validation("instrument code is empty".to_string()));
        }
        if self.buy_shares == Some(0) || self.sell_shares == Some(0) {
            return fail("share caps must be positive".to_string());
        }
        if let Some(amount) = self.max_order_amount {
            if amount <= Decimal::ZERO {
                return fail(format!("max_order_amount must be positive, got {}", amount));
            }
        }
        let max_ratio = Decimal::from(50);
        for (name, ratio) in [
            ("overnight_buy_ratio", self.overnight_buy_ratio),
            ("overnight_sell_ratio", self.overnight_sell_ratio),
        ] {
            if ratio <= Decimal::ZERO || ratio >= max_ratio {
                return fail(format!("{} out of range: {}", name, ratio));
            }
        }
        if !(self.stop_loss_pct.is_finite() && self.stop_loss_pct > 0.0 && self.stop_loss_pct < 0.2) {
            return fail(format!("stop_loss_pct out of range: {}", self.stop_loss_pct));
        }
        if !(self.base_profit_target.is_finite()
            && self.base_profit_target > 0.0
            && self.base_profit_target < 0.5)
        {
            return fail(format!("base_profit_target out of range: {}", self.base_profit_target));
        }
        let pct = self.percentage;
        if !(pct.buy_threshold_pct.is_finite() && pct.buy_threshold_pct > 0.0)
            || !(pct.sell_threshold_pct.is_finite() && pct.sell_threshold_pct > 0.0)
        {
            return fail("percentage thresholds must be positive".to_string());
        }
        if self.grid.min_cells < 2 || self.grid.min_cells > self.grid.max_cells {
            return fail(format!(
                "grid cell range invalid: {}..{}",
                self.grid.min_cells, self.grid.max_cells
            ));
        }
        if self.no_new_entry_after > self.force_close_at {
            return fail("no_new_entry_after must not be later than force_close_at".to_string());
        }
        Ok(())
    }
}

/// Collection of strategy configs, usually loaded from YAML
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StrategyBook {
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

impl StrategyBook {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let book: StrategyBook = serde_yaml::from_str(yaml)
            .map_err(|e| RunnerError::Config(format!("invalid strategy book: {}", e)))?;
        for config in &book.strategies {
            config.validate()?;
        }
        Ok(book)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&yaml)
    }

    pub fn get(&self, instrument: &str) -> Option<&StrategyConfig> {
        self.strategies.iter().find(|c| c.instrument == instrument)
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn default_true() -> bool { true }
fn default_no_new_entry_after() -> NaiveTime { hm(14, 30) }
fn default_weak_stock_entry_cutoff() -> NaiveTime { hm(14, 0) }
fn default_weak_market_entry_cutoff() -> NaiveTime { hm(13, 30) }
fn default_force_close_at() -> NaiveTime { hm(14, 50) }
fn default_early_session_until() -> NaiveTime { hm(10, 40) }
fn default_overnight_ratio() -> Decimal { Decimal::ONE }
fn default_stop_loss_pct() -> f64 { 0.008 }
fn default_base_profit_target() -> f64 { 0.010 }
fn default_pct_threshold() -> f64 { 0.5 }
fn default_grid_min_cells() -> u32 { 6 }
fn default_grid_max_cells() -> u32 { 8 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_defaults_applied() {
        let book = StrategyBook::from_yaml_str(
            r#"
strategies:
  - instrument: "600519"
  - instrument: "000001"
    strategy: percentage
    sell_shares: 500
    market_filter_enabled: false
    no_new_entry_after: "14:00:00"
"#,
        )
        .unwrap();

        let first = book.get("600519").unwrap();
        assert_eq!(first.strategy, StrategyKind::MultiFactor);
        assert!(first.active);
        assert_eq!(first.no_new_entry_after, hm(14, 30));
        assert_eq!(first.overnight_sell_ratio, Decimal::ONE);

        let second = book.get("000001").unwrap();
        assert_eq!(second.strategy, StrategyKind::Percentage);
        assert_eq!(second.sell_shares, Some(500));
        assert!(!second.market_filter_enabled);
        assert_eq!(second.no_new_entry_after, hm(14, 0));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StrategyConfig::new("600519");
        assert!(config.validate().is_ok());

        config.overnight_sell_ratio = Decimal::ZERO;
        assert!(matches!(config.validate(), Err(RunnerError::Validation(_))));

        let mut config = StrategyConfig::new("600519");
        config.stop_loss_pct = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = StrategyConfig::new("600519");
        config.buy_shares = Some(0);
        assert!(config.validate().is_err());

        assert!(StrategyConfig::new(" ").validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = StrategyBook::from_yaml_str("strategies:\n  - instrument: 1\n    stop_loss_pct: abc\n")
            .unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_load_book_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"strategies:\n  - instrument: \"600519\"\n    strategy: grid\n").unwrap();

        let book = tokio_test::block_on(StrategyBook::load(file.path())).unwrap();
        assert_eq!(book.get("600519").unwrap().strategy, StrategyKind::Grid);
        assert!(book.get("000001").is_none());
    }
}
