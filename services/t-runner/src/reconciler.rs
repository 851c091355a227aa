//! Lock reconciliation - recover execution locks nobody will release
//!
//! A lock outlives its order when the runner is cancelled mid-submission or
//! the fill never arrives. At startup every lock is cleared; afterwards a
//! periodic sweep drops locks whose lease ran out.

use chrono::Duration as LeaseDuration;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::store::StateStore;
use crate::types::Result;

pub struct LockReconciler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    lease: LeaseDuration,
    last_sweep: Option<Instant>,
    sweep_interval: Duration,
}

impl LockReconciler {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, lease: LeaseDuration) -> Self {
        Self {
            store,
            clock,
            lease,
            last_sweep: None,
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Set sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn is_due(&self) -> bool {
        self.last_sweep
            .map(|last| last.elapsed() >= self.sweep_interval)
            .unwrap_or(true)
    }

    /// Release every lock; no order can be in flight before any runner starts
    pub async fn reset_on_startup(&self) -> Result<usize> {
        let released = self.store.reset_all_locks().await?;
        info!("Startup lock reset released {} locks", released);
        Ok(released)
    }

    /// Release expired leases, returning the affected instruments
    pub async fn sweep(&mut self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let expired = self.store.expire_locks(now, self.lease).await?;
        for instrument in &expired {
            warn!("⏰ Execution lock on {} expired without a fill, released", instrument);
        }
        if expired.is_empty() {
            debug!("Lock sweep: nothing expired");
        }
        self.last_sweep = Some(Instant::now());
        Ok(expired)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if !self.is_due() {
                        continue;
                    }
                    if let Err(e) = self.sweep().await {
                        error!("Lock sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("Lock reconciler stopped");
    }
}
