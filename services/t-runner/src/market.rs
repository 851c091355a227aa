//! Quote source interface

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{Bar, Result, Tick};

/// Market data collaborator
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Latest snapshot, `None` when the instrument has no quote right now
    async fn get_tick(&self, instrument: &str) -> Result<Option<Tick>>;

    /// Most recent `count` bars of `bar_minutes` length, oldest first
    async fn get_bars(&self, instrument: &str, bar_minutes: u32, count: usize) -> Result<Vec<Bar>>;

    /// Mean bar volume of the previous session, if known
    async fn prior_session_volume(&self, instrument: &str) -> Result<Option<f64>>;
}

/// In-process quote source fed by the caller
#[derive(Debug, Default)]
pub struct MemoryQuoteSource {
    ticks: RwLock<HashMap<String, Tick>>,
    bars: RwLock<HashMap<String, Vec<Bar>>>,
    prior_volume: RwLock<HashMap<String, f64>>,
}

impl MemoryQuoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_tick(&self, instrument: &str, tick: Tick) {
        self.ticks.write().await.insert(instrument.to_string(), tick);
    }

    pub async fn clear_tick(&self, instrument: &str) {
        self.ticks.write().await.remove(instrument);
    }

    pub async fn set_bars(&self, instrument: &str, bars: Vec<Bar>) {
        self.bars.write().await.insert(instrument.to_string(), bars);
    }

    pub async fn set_prior_volume(&self, instrument: &str, volume: f64) {
        self.prior_volume.write().await.insert(instrument.to_string(), volume);
    }
}

#[async_trait]
impl QuoteSource for MemoryQuoteSource {
    async fn get_tick(&self, instrument: &str) -> Result<Option<Tick>> {
        Ok(self.ticks.read().await.get(instrument).copied())
    }

    async fn get_bars(&self, instrument: &str, _bar_minutes: u32, count: usize) -> Result<Vec<Bar>> {
        let bars = self.bars.read().await;
        let series = bars.get(instrument).map(Vec::as_slice).unwrap_or_default();
        Ok(series[series.len().saturating_sub(count)..].to_vec())
    }

    async fn prior_session_volume(&self, instrument: &str) -> Result<Option<f64>> {
        Ok(self.prior_volume.read().await.get(instrument).copied())
    }
}
