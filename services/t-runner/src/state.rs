//! JSON file store
//!
//! Layout under the workspace directory:
//!
//! ```text
//! state/<instrument>/config.json
//! state/<instrument>/account.json
//! state/<instrument>/open_loop.json
//! state/<instrument>/lock.json
//! journal/<instrument>/trades.jsonl
//! journal/<instrument>/loops.jsonl
//! ```
//!
//! Lock files are created with `create_new`, so acquiring a free lock is a
//! single atomic filesystem operation. The in-process mutex serialises the
//! read-modify-write paths (lease takeover, release).

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::portfolio::PositionAccount;
use crate::store::{LockLease, StateStore};
use crate::trade_loop::TradeLoop;
use crate::types::{Result, RunnerError, TradeRecord};

pub struct JsonFileStore {
    state_dir: PathBuf,
    journal_dir: PathBuf,
    write_guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(workspace_dir: impl AsRef<Path>) -> Self {
        let base = workspace_dir.as_ref();
        Self {
            state_dir: base.join("state"),
            journal_dir: base.join("journal"),
            write_guard: Mutex::new(()),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.journal_dir).await?;
        Ok(())
    }

    fn instrument_dir(&self, instrument: &str) -> Result<PathBuf> {
        Ok(self.state_dir.join(safe_name(instrument)?))
    }

    fn journal_path(&self, instrument: &str, name: &str) -> Result<PathBuf> {
        Ok(self.journal_dir.join(safe_name(instrument)?).join(name))
    }

    fn lock_path(&self, instrument: &str) -> Result<PathBuf> {
        Ok(self.instrument_dir(instrument)?.join("lock.json"))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file and rename so readers never see half a file
    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(value)?).await?;
        fs::rename(&tmp, path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            items.push(serde_json::from_str(line)?);
        }
        Ok(items)
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the lock file only if it does not exist yet
    async fn create_lock_file(path: &Path, lease: &LockLease) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let opened = fs::OpenOptions::new().write(true).create_new(true).open(path).await;
        match opened {
            Ok(mut file) => {
                file.write_all(serde_json::to_string(lease)?.as_bytes()).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Instrument codes become directory names
fn safe_name(instrument: &str) -> Result<String> {
    let valid = !instrument.is_empty()
        && instrument
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        && !instrument.starts_with('.');
    if valid {
        Ok(instrument.to_string())
    } else {
        Err(RunnerError::Store(format!("invalid instrument code: {:?}", instrument)))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_config(&self, instrument: &str) -> Result<Option<StrategyConfig>> {
        Self::read_json(&self.instrument_dir(instrument)?.join("config.json")).await
    }

    async fn save_config(&self, config: &StrategyConfig) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        Self::write_json(&self.instrument_dir(&config.instrument)?.join("config.json"), config).await
    }

    async fn instruments(&self) -> Result<Vec<String>> {
        let mut instruments = Vec::new();
        let mut entries = match fs::read_dir(&self.state_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(instruments),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if fs::try_exists(entry.path().join("config.json")).await? {
                instruments.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        instruments.sort();
        Ok(instruments)
    }

    async fn load_account(&self, instrument: &str) -> Result<PositionAccount> {
        Ok(Self::read_json(&self.instrument_dir(instrument)?.join("account.json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_account(&self, instrument: &str, account: &PositionAccount) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        Self::write_json(&self.instrument_dir(instrument)?.join("account.json"), account).await
    }

    async fn open_loop(&self, instrument: &str) -> Result<Option<TradeLoop>> {
        Self::read_json(&self.instrument_dir(instrument)?.join("open_loop.json")).await
    }

    async fn save_loop(&self, trade_loop: &TradeLoop) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let open_path = self.instrument_dir(&trade_loop.instrument)?.join("open_loop.json");
        if trade_loop.closed {
            Self::append_line(&self.journal_path(&trade_loop.instrument, "loops.jsonl")?, trade_loop).await?;
            let current: Option<TradeLoop> = Self::read_json(&open_path).await?;
            if current.map(|open| open.id == trade_loop.id).unwrap_or(false) {
                Self::remove_if_exists(&open_path).await?;
            }
            Ok(())
        } else {
            Self::write_json(&open_path, trade_loop).await
        }
    }

    async fn closed_loops(&self, instrument: &str) -> Result<Vec<TradeLoop>> {
        Self::read_lines(&self.journal_path(instrument, "loops.jsonl")?).await
    }

    async fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        Self::append_line(&self.journal_path(&trade.instrument, "trades.jsonl")?, trade).await
    }

    async fn trades(&self, instrument: &str) -> Result<Vec<TradeRecord>> {
        Self::read_lines(&self.journal_path(instrument, "trades.jsonl")?).await
    }

    async fn try_acquire_lock(
        &self,
        instrument: &str,
        order_id: Uuid,
        now: NaiveDateTime,
        lease: Duration,
    ) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let path = self.lock_path(instrument)?;
        let wanted = LockLease { order_id, held_since: now };

        if Self::create_lock_file(&path, &wanted).await? {
            return Ok(true);
        }

        let held: Option<LockLease> = Self::read_json(&path).await?;
        match held {
            Some(held) if !held.is_expired(now, lease) => Ok(false),
            _ => {
                warn!("Taking over expired lock on {}", instrument);
                Self::write_json(&path, &wanted).await?;
                Ok(true)
            }
        }
    }

    async fn lock_status(&self, instrument: &str) -> Result<Option<LockLease>> {
        Self::read_json(&self.lock_path(instrument)?).await
    }

    async fn release_lock(&self, instrument: &str, order_id: Uuid) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let path = self.lock_path(instrument)?;
        let held: Option<LockLease> = Self::read_json(&path).await?;
        match held {
            Some(held) if held.order_id == order_id => {
                Self::remove_if_exists(&path).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_all_locks(&self) -> Result<usize> {
        let _guard = self.write_guard.lock().await;
        let mut released = 0;
        for instrument in self.instruments().await? {
            let path = self.lock_path(&instrument)?;
            if fs::try_exists(&path).await? {
                Self::remove_if_exists(&path).await?;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn expire_locks(&self, now: NaiveDateTime, lease: Duration) -> Result<Vec<String>> {
        let _guard = self.write_guard.lock().await;
        let mut expired = Vec::new();
        for instrument in self.instruments().await? {
            let path = self.lock_path(&instrument)?;
            let held: Option<LockLease> = Self::read_json(&path).await?;
            if held.map(|h| h.is_expired(now, lease)).unwrap_or(false) {
                Self::remove_if_exists(&path).await?;
                expired.push(instrument);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Side};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    async fn store() -> (TempDir, JsonFileStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_config_and_account_round_trip() {
        let (_dir, store) = store().await;
        store.save_config(&StrategyConfig::new("600519")).await.unwrap();

        assert_eq!(store.instruments().await.unwrap(), vec!["600519".to_string()]);
        assert_eq!(store.load_config("600519").await.unwrap(), Some(StrategyConfig::new("600519")));
        assert_eq!(store.load_account("600519").await.unwrap(), PositionAccount::default());

        let account = PositionAccount::new(Decimal::from(5_000), 200);
        store.save_account("600519", &account).await.unwrap();
        assert_eq!(store.load_account("600519").await.unwrap(), account);
    }

    #[tokio::test]
    async fn test_lock_file_lifecycle() {
        let (_dir, store) = store().await;
        store.save_config(&StrategyConfig::new("600519")).await.unwrap();
        let lease = Duration::minutes(2);
        let order = Uuid::new_v4();

        assert!(store.try_acquire_lock("600519", order, at(10, 0), lease).await.unwrap());
        assert!(!store.try_acquire_lock("600519", Uuid::new_v4(), at(10, 1), lease).await.unwrap());
        assert_eq!(store.lock_status("600519").await.unwrap().unwrap().order_id, order);

        assert_eq!(store.reset_all_locks().await.unwrap(), 1);
        assert!(store.lock_status("600519").await.unwrap().is_none());
        assert!(!store.release_lock("600519", order).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_locks_swept() {
        let (_dir, store) = store().await;
        store.save_config(&StrategyConfig::new("600519")).await.unwrap();
        let lease = Duration::minutes(2);
        store.try_acquire_lock("600519", Uuid::new_v4(), at(10, 0), lease).await.unwrap();

        assert!(store.expire_locks(at(10, 1), lease).await.unwrap().is_empty());
        assert_eq!(store.expire_locks(at(10, 3), lease).await.unwrap(), vec!["600519".to_string()]);
    }

    #[tokio::test]
    async fn test_journal_appends() {
        let (_dir, store) = store().await;
        let mut trade_loop = TradeLoop::open("600519", Direction::SellFirst, Decimal::TEN, 100, at(10, 0));
        store.save_loop(&trade_loop).await.unwrap();
        assert_eq!(store.open_loop("600519").await.unwrap(), Some(trade_loop.clone()));

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            instrument: "600519".to_string(),
            side: Side::Buy,
            price: Decimal::new(990, 2),
            volume: 100,
            amount: Decimal::from(990),
            timestamp: at(10, 20),
            loop_id: trade_loop.id,
        };
        store.append_trade(&trade).await.unwrap();

        trade_loop.close(Decimal::new(990, 2), 100, at(10, 20));
        store.save_loop(&trade_loop).await.unwrap();

        assert!(store.open_loop("600519").await.unwrap().is_none());
        assert_eq!(store.trades("600519").await.unwrap(), vec![trade]);
        assert_eq!(store.closed_loops("600519").await.unwrap()[0].profit, Some(Decimal::from(10)));
    }

    #[test]
    fn test_rejects_path_like_codes() {
        assert!(safe_name("../etc").is_err());
        assert!(safe_name("600519.SH").is_ok());
        assert!(safe_name("").is_err());
    }
}
