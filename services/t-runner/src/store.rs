//! Persistence interface and the in-memory store
//!
//! The execution lock is a lease: acquiring it is one compare-and-set inside
//! the store, and a lease older than its duration counts as free.

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::portfolio::PositionAccount;
use crate::trade_loop::TradeLoop;
use crate::types::{Result, TradeRecord};

/// Held execution lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockLease {
    pub order_id: Uuid,
    pub held_since: NaiveDateTime,
}

impl LockLease {
    pub fn is_expired(&self, now: NaiveDateTime, lease: Duration) -> bool {
        now - self.held_since >= lease
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_config(&self, instrument: &str) -> Result<Option<StrategyConfig>>;
    async fn save_config(&self, config: &StrategyConfig) -> Result<()>;
    async fn instruments(&self) -> Result<Vec<String>>;

    /// Account for `instrument`; a fresh default account when none is stored
    async fn load_account(&self, instrument: &str) -> Result<PositionAccount>;
    async fn save_account(&self, instrument: &str, account: &PositionAccount) -> Result<()>;

    async fn open_loop(&self, instrument: &str) -> Result<Option<TradeLoop>>;
    /// Store a loop. A closed loop leaves the open slot and joins the history.
    async fn save_loop(&self, trade_loop: &TradeLoop) -> Result<()>;
    async fn closed_loops(&self, instrument: &str) -> Result<Vec<TradeLoop>>;

    async fn append_trade(&self, trade: &TradeRecord) -> Result<()>;
    async fn trades(&self, instrument: &str) -> Result<Vec<TradeRecord>>;

    /// Take the lock only if it is free or its lease expired
    async fn try_acquire_lock(
        &self,
        instrument: &str,
        order_id: Uuid,
        now: NaiveDateTime,
        lease: Duration,
    ) -> Result<bool>;
    async fn lock_status(&self, instrument: &str) -> Result<Option<LockLease>>;
    /// Release the lock if `order_id` still holds it
    async fn release_lock(&self, instrument: &str, order_id: Uuid) -> Result<bool>;
    /// Release every lock, returning how many were held
    async fn reset_all_locks(&self) -> Result<usize>;
    /// Release locks whose lease ran out, returning their instruments
    async fn expire_locks(&self, now: NaiveDateTime, lease: Duration) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct Inner {
    configs: HashMap<String, StrategyConfig>,
    accounts: HashMap<String, PositionAccount>,
    open_loops: HashMap<String, TradeLoop>,
    closed_loops: HashMap<String, Vec<TradeLoop>>,
    trades: HashMap<String, Vec<TradeRecord>>,
    locks: HashMap<String, LockLease>,
}

/// Store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_config(&self, instrument: &str) -> Result<Option<StrategyConfig>> {
        Ok(self.inner.lock().await.configs.get(instrument).cloned())
    }

    async fn save_config(&self, config: &StrategyConfig) -> Result<()> {
        self.inner
            .lock()
            .await
            .configs
            .insert(config.instrument.clone(), config.clone());
        Ok(())
    }

    async fn instruments(&self) -> Result<Vec<String>> {
        let mut instruments: Vec<String> = self.inner.lock().await.configs.keys().cloned().collect();
        instruments.sort();
        Ok(instruments)
    }

    async fn load_account(&self, instrument: &str) -> Result<PositionAccount> {
        Ok(self
            .inner
            .lock()
            .await
            .accounts
            .get(instrument)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_account(&self, instrument: &str, account: &PositionAccount) -> Result<()> {
        self.inner
            .lock()
            .await
            .accounts
            .insert(instrument.to_string(), account.clone());
        Ok(())
    }

    async fn open_loop(&self, instrument: &str) -> Result<Option<TradeLoop>> {
        Ok(self.inner.lock().await.open_loops.get(instrument).cloned())
    }

    async fn save_loop(&self, trade_loop: &TradeLoop) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if trade_loop.closed {
            if inner
                .open_loops
                .get(&trade_loop.instrument)
                .map(|open| open.id == trade_loop.id)
                .unwrap_or(false)
            {
                inner.open_loops.remove(&trade_loop.instrument);
            }
            inner
                .closed_loops
                .entry(trade_loop.instrument.clone())
                .or_default()
                .push(trade_loop.clone());
        } else {
            inner
                .open_loops
                .insert(trade_loop.instrument.clone(), trade_loop.clone());
        }
        Ok(())
    }

    async fn closed_loops(&self, instrument: &str) -> Result<Vec<TradeLoop>> {
        Ok(self
            .inner
            .lock()
            .await
            .closed_loops
            .get(instrument)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.inner
            .lock()
            .await
            .trades
            .entry(trade.instrument.clone())
            .or_default()
            .push(trade.clone());
        Ok(())
    }

    async fn trades(&self, instrument: &str) -> Result<Vec<TradeRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .trades
            .get(instrument)
            .cloned()
            .unwrap_or_default())
    }

    async fn try_acquire_lock(
        &self,
        instrument: &str,
        order_id: Uuid,
        now: NaiveDateTime,
        lease: Duration,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if let Some(held) = inner.locks.get(instrument) {
            if !held.is_expired(now, lease) {
                return Ok(false);
            }
        }
        inner.locks.insert(
            instrument.to_string(),
            LockLease { order_id, held_since: now },
        );
        Ok(true)
    }

    async fn lock_status(&self, instrument: &str) -> Result<Option<LockLease>> {
        Ok(self.inner.lock().await.locks.get(instrument).cloned())
    }

    async fn release_lock(&self, instrument: &str, order_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get(instrument) {
            Some(held) if held.order_id == order_id => {
                inner.locks.remove(instrument);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_all_locks(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let count = inner.locks.len();
        inner.locks.clear();
        Ok(count)
    }

    async fn expire_locks(&self, now: NaiveDateTime, lease: Duration) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let mut expired: Vec<String> = inner
            .locks
            .iter()
            .filter(|(_, held)| held.is_expired(now, lease))
            .map(|(instrument, _)| instrument.clone())
            .collect();
        for instrument in &expired {
            inner.locks.remove(instrument);
        }
        expired.sort();
        Ok(expired)
    }
}
