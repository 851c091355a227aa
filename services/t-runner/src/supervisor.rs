//! Supervisor - owns one runner task per instrument

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{DecisionEvent, RunnerEvent};
use crate::fills::FillHandler;
use crate::runner::{InstrumentRunner, RunnerContext};
use crate::types::{Fill, Result};

struct RunnerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    ctx: RunnerContext,
    runners: HashMap<String, RunnerHandle>,
    latest: Arc<RwLock<HashMap<String, DecisionEvent>>>,
    collector: JoinHandle<()>,
}

impl Supervisor {
    /// Builds the supervisor and starts collecting decision events
    pub fn new(ctx: RunnerContext) -> Self {
        let latest = Arc::new(RwLock::new(HashMap::new()));
        let collector = tokio::spawn(collect_decisions(ctx.events.subscribe(), latest.clone()));
        Self {
            ctx,
            runners: HashMap::new(),
            latest,
            collector,
        }
    }

    pub fn context(&self) -> &RunnerContext {
        &self.ctx
    }

    /// Start monitoring `instrument`, replacing any task already running
    pub async fn start(&mut self, instrument: &str) {
        if self.runners.contains_key(instrument) {
            self.stop(instrument).await;
        }

        let (shutdown, rx) = watch::channel(false);
        let runner = InstrumentRunner::new(instrument, self.ctx.clone());
        let task = tokio::spawn(runner.run(rx));
        self.runners
            .insert(instrument.to_string(), RunnerHandle { shutdown, task });
        info!("▶️ Monitoring {}", instrument);
    }

    /// Stop monitoring `instrument`; returns false if it was not running
    pub async fn stop(&mut self, instrument: &str) -> bool {
        let Some(handle) = self.runners.remove(instrument) else {
            return false;
        };
        if handle.shutdown.send(true).is_err() {
            debug!("Runner for {} already gone", instrument);
        }
        if let Err(e) = handle.task.await {
            error!("Runner task for {} ended abnormally: {}", instrument, e);
        }
        info!("⏹️ Stopped monitoring {}", instrument);
        true
    }

    pub async fn stop_all(&mut self) {
        let instruments: Vec<String> = self.runners.keys().cloned().collect();
        for instrument in instruments {
            self.stop(&instrument).await;
        }
    }

    pub fn is_running(&self, instrument: &str) -> bool {
        self.runners
            .get(instrument)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    pub fn running_instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self
            .runners
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(i, _)| i.clone())
            .collect();
        instruments.sort();
        instruments
    }

    /// Latest decision published for `instrument`
    pub async fn latest_decision(&self, instrument: &str) -> Option<DecisionEvent> {
        self.latest.read().await.get(instrument).cloned()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.collector.abort();
        for handle in self.runners.values() {
            let _ = handle.shutdown.send(true);
        }
    }
}

async fn collect_decisions(
    mut events: broadcast::Receiver<RunnerEvent>,
    latest: Arc<RwLock<HashMap<String, DecisionEvent>>>,
) {
    loop {
        match events.recv().await {
            Ok(RunnerEvent::Decision(decision)) => {
                latest.write().await.insert(decision.instrument.clone(), decision);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Decision collector skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Feed fills from the execution client into the handler
pub fn spawn_fill_pump(mut fills: mpsc::UnboundedReceiver<Fill>, handler: Arc<FillHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fill) = fills.recv().await {
            let order_id = fill.order_id;
            if let Err(e) = handler.on_fill(fill).await {
                error!("Fill for order {} not applied: {}", order_id, e);
            }
        }
        debug!("Fill channel closed");
    })
}

/// Poll a live gateway for fills and forward them to the handler
pub fn spawn_fill_poller<F, Fut>(
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<FillHandler>,
    mut poll: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Vec<Fill>>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match poll().await {
                        Ok(fills) => {
                            for fill in fills {
                                let order_id = fill.order_id;
                                if let Err(e) = handler.on_fill(fill).await {
                                    error!("Fill for order {} not applied: {}", order_id, e);
                                }
                            }
                        }
                        Err(e) => warn!("Fill poll failed: {}", e),
                    }
                }
            }
        }
    })
}
