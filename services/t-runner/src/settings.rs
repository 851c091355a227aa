//! Process-wide runner settings
//!
//! Layered as: built-in defaults, then an optional settings file, then
//! `T_RUNNER__*` environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub mode: TradingMode,
    /// Instruments started at boot
    pub instruments: Vec<String>,
    /// Wait between the end of one iteration and the start of the next
    pub poll_interval_secs: u64,
    pub error_backoff_secs: u64,
    /// Bound on each quote and order network call
    pub network_timeout_ms: u64,
    pub lot_size: u64,
    pub bar_minutes: u32,
    pub lookback_bars: usize,
    pub benchmark: String,
    pub benchmark_bar_minutes: u32,
    pub benchmark_lookback_bars: usize,
    /// Locks older than this are treated as abandoned
    pub lock_lease_secs: u64,
    pub lock_sweep_interval_secs: u64,
    pub exchange_utc_offset_hours: i32,
    pub quote_url: String,
    pub execution_url: String,
    pub state_dir: PathBuf,
    pub strategy_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            instruments: Vec::new(),
            poll_interval_secs: 5,
            error_backoff_secs: 2,
            network_timeout_ms: 3_000,
            lot_size: 100,
            bar_minutes: 1,
            lookback_bars: 240,
            benchmark: "000001.SH".to_string(),
            benchmark_bar_minutes: 5,
            benchmark_lookback_bars: 48,
            lock_lease_secs: 120,
            lock_sweep_interval_secs: 30,
            exchange_utc_offset_hours: 8,
            quote_url: "http://localhost:8080".to_string(),
            execution_url: "http://localhost:8081".to_string(),
            state_dir: default_state_dir(),
            strategy_file: None,
            log_level: "info".to_string(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("t-runner")
}

impl RunnerSettings {
    /// Load settings, with `path` as an optional settings file
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("T_RUNNER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("instruments")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn lock_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lock_lease_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = RunnerSettings::default();
        assert_eq!(settings.lot_size, 100);
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.error_backoff(), Duration::from_secs(2));
        assert_eq!(settings.mode, TradingMode::Paper);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "poll_interval_secs: 10\nlot_size: 200\nmode: live").unwrap();

        let settings = RunnerSettings::load(file.path().to_str()).unwrap();
        assert_eq!(settings.poll_interval_secs, 10);
        assert_eq!(settings.lot_size, 200);
        assert_eq!(settings.mode, TradingMode::Live);
        assert_eq!(settings.bar_minutes, 1);
    }
}
