//! Instrument runner - the per-instrument polling loop
//!
//! One task per instrument. Each iteration: skip while the execution lock is
//! held, evaluate, size, take the lock with a single compare-and-set, submit.
//! A rejected or failed submission releases the lock in the same iteration;
//! an accepted one leaves it for the fill handler.

use chrono::{NaiveDate, NaiveDateTime};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bars::{floor_to_bar, BarSeries};
use crate::clock::Clock;
use crate::config::StrategyConfig;
use crate::engine::{Decision, DecisionEngine, DecisionInput, PlannedOrder};
use crate::events::{DecisionEvent, EventBus, RunnerEvent};
use crate::executor::{ExecutionClient, OrderRequest, SubmitAck};
use crate::intent::{IntentRegistry, OrderIntentState};
use crate::market::QuoteSource;
use crate::settings::RunnerSettings;
use crate::store::StateStore;
use crate::trade_loop::LoopState;
use crate::types::{price_to_decimal, Result, RunnerError};

/// Collaborators shared by every runner
#[derive(Clone)]
pub struct RunnerContext {
    pub settings: Arc<RunnerSettings>,
    pub engine: DecisionEngine,
    pub quotes: Arc<dyn QuoteSource>,
    pub executor: Arc<dyn ExecutionClient>,
    pub store: Arc<dyn StateStore>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

/// What one iteration did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// An order is in flight
    LockHeld,
    /// No usable quote this tick
    NoQuote,
    /// Evaluated without anything to submit
    Evaluated(Decision),
    /// Order planned but the instrument is paused
    Inactive(Decision),
    /// Config changed between evaluation and submission
    ConfigChanged,
    /// Another evaluation took the lock first
    LockContended,
    Submitted { order_id: Uuid, order: PlannedOrder },
    SubmissionRejected { order_id: Uuid, reason: String },
    SubmissionFailed { order_id: Uuid, error: String },
}

pub struct InstrumentRunner {
    instrument: String,
    ctx: RunnerContext,
    bars: BarSeries,
    benchmark: BarSeries,
    /// Session the instrument bars were loaded for
    bars_session: Option<NaiveDate>,
    benchmark_bar: Option<NaiveDateTime>,
    yesterday_volume: Option<(NaiveDate, Option<f64>)>,
    intents: IntentRegistry,
    fills: broadcast::Receiver<RunnerEvent>,
    last_decision: Option<Decision>,
}

impl InstrumentRunner {
    pub fn new(instrument: &str, ctx: RunnerContext) -> Self {
        let settings = ctx.settings.clone();
        let fills = ctx.events.subscribe();
        Self {
            instrument: instrument.to_string(),
            bars: BarSeries::new(settings.lookback_bars, settings.bar_minutes),
            benchmark: BarSeries::new(settings.benchmark_lookback_bars, settings.benchmark_bar_minutes),
            bars_session: None,
            benchmark_bar: None,
            yesterday_volume: None,
            intents: IntentRegistry::new(),
            fills,
            last_decision: None,
            ctx,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn last_decision(&self) -> Option<&Decision> {
        self.last_decision.as_ref()
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    /// Loop until `shutdown` flips to true or its sender goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 Runner for {} starting", self.instrument);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                outcome = AssertUnwindSafe(self.run_once()).catch_unwind() => outcome,
            };

            let pause = match outcome {
                Ok(Ok(outcome)) => {
                    debug!("{} iteration: {:?}", self.instrument, outcome);
                    self.ctx.settings.poll_interval()
                }
                Ok(Err(e)) => {
                    warn!("⚠️ {} iteration failed: {}", self.instrument, e);
                    self.ctx.settings.error_backoff()
                }
                Err(_) => {
                    error!("💥 {} iteration panicked, backing off", self.instrument);
                    self.ctx.settings.error_backoff()
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("🛑 Runner for {} stopped", self.instrument);
    }

    /// One pass through the pipeline
    pub async fn run_once(&mut self) -> Result<TickOutcome> {
        self.track_fills();
        self.intents.cleanup();

        let store = self.ctx.store.clone();
        let now = self.ctx.clock.now();
        let lease = self.ctx.settings.lock_lease();

        if let Some(held) = store.lock_status(&self.instrument).await? {
            if !held.is_expired(now, lease) {
                debug!("🔒 {} lock held by order {}", self.instrument, held.order_id);
                return Ok(TickOutcome::LockHeld);
            }
        }

        let config = self.load_config().await?;

        let quotes = self.ctx.quotes.clone();
        let Some(tick) = self.bounded(quotes.get_tick(&self.instrument)).await? else {
            debug!("No quote for {}", self.instrument);
            return Ok(TickOutcome::NoQuote);
        };
        let Some(price) = price_to_decimal(tick.close) else {
            debug!("Unusable quote price {} for {}", tick.close, self.instrument);
            return Ok(TickOutcome::NoQuote);
        };

        self.refresh_bars(now).await?;
        self.refresh_benchmark(now).await;
        let yesterday_volume = self.yesterday_volume(now.date()).await;
        self.bars.apply_tick(&tick);

        let mut account = store.load_account(&self.instrument).await?;
        if account.roll_session(now.date()) {
            store.save_account(&self.instrument, &account).await?;
        }
        let state = LoopState::from_open_loop(store.open_loop(&self.instrument).await?);

        let bars = self.bars.to_vec();
        let benchmark_bars = self.benchmark.to_vec();
        let decision = self.ctx.engine.evaluate(&DecisionInput {
            config: &config,
            bars: &bars,
            benchmark_bars: &benchmark_bars,
            yesterday_volume,
            price,
            now,
            state: &state,
            account: &account,
        });
        self.ctx.events.publish(RunnerEvent::Decision(DecisionEvent::from(&decision)));
        self.last_decision = Some(decision.clone());

        let Some(order) = decision.planned_order().cloned() else {
            debug!("{} {}: {}", self.instrument, decision.signal, decision.reason);
            return Ok(TickOutcome::Evaluated(decision));
        };

        info!(
            "📈 {} {} {} @ {} ({})",
            self.instrument, order.side, order.volume, order.price, decision.reason
        );

        if !config.active {
            info!("⏸️ {} is paused, not submitting", self.instrument);
            return Ok(TickOutcome::Inactive(decision));
        }

        // Config may have been edited while we evaluated
        if store.load_config(&self.instrument).await?.as_ref() != Some(&config) {
            info!("Config for {} changed mid-iteration, skipping submission", self.instrument);
            return Ok(TickOutcome::ConfigChanged);
        }

        let order_id = Uuid::new_v4();
        if !store.try_acquire_lock(&self.instrument, order_id, now, lease).await? {
            info!("🔒 {} lock taken by a concurrent evaluation", self.instrument);
            return Ok(TickOutcome::LockContended);
        }

        self.submit(order_id, order, &decision, now).await
    }

    async fn submit(
        &mut self,
        order_id: Uuid,
        order: PlannedOrder,
        decision: &Decision,
        now: NaiveDateTime,
    ) -> Result<TickOutcome> {
        self.intents.create(
            order_id,
            &self.instrument,
            order.side,
            order.price,
            order.volume,
            &decision.reason,
            now,
        );

        let request = OrderRequest {
            order_id,
            instrument: self.instrument.clone(),
            side: order.side,
            price: order.price,
            volume: order.volume,
            submitted_at: now,
        };

        let executor = self.ctx.executor.clone();
        let result = self.bounded(executor.submit_order(&request)).await;

        let outcome = match result {
            Ok(SubmitAck::Accepted) => {
                info!("📤 Order {} submitted for {}", order_id, self.instrument);
                return Ok(TickOutcome::Submitted { order_id, order });
            }
            Ok(SubmitAck::Rejected { reason }) => {
                warn!("❌ Order {} for {} rejected: {}", order_id, self.instrument, reason);
                self.intents
                    .update_state(&order_id, OrderIntentState::Rejected { reason: reason.clone() })?;
                TickOutcome::SubmissionRejected { order_id, reason }
            }
            Err(e) => {
                warn!("❌ Order {} for {} failed: {}", order_id, self.instrument, e);
                self.intents
                    .update_state(&order_id, OrderIntentState::Failed { error: e.to_string() })?;
                TickOutcome::SubmissionFailed { order_id, error: e.to_string() }
            }
        };

        self.ctx.store.release_lock(&self.instrument, order_id).await?;
        debug!("🔑 {} lock released after unsuccessful submission", self.instrument);
        Ok(outcome)
    }

    async fn load_config(&self) -> Result<StrategyConfig> {
        let config = self
            .ctx
            .store
            .load_config(&self.instrument)
            .await?
            .ok_or_else(|| RunnerError::Config(format!("no strategy config for {}", self.instrument)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reload the instrument history at the start of each session
    async fn refresh_bars(&mut self, now: NaiveDateTime) -> Result<()> {
        if self.bars_session == Some(now.date()) {
            return Ok(());
        }
        let settings = self.ctx.settings.clone();
        let quotes = self.ctx.quotes.clone();
        let bars = self
            .bounded(quotes.get_bars(&self.instrument, settings.bar_minutes, settings.lookback_bars))
            .await?;
        debug!("Loaded {} bars for {}", bars.len(), self.instrument);
        self.bars = BarSeries::from_bars(bars, settings.lookback_bars, settings.bar_minutes);
        self.bars_session = Some(now.date());
        Ok(())
    }

    /// Refresh the benchmark once per benchmark bar. Failure leaves the old
    /// series in place and the regime falls back to neutral once it is stale.
    async fn refresh_benchmark(&mut self, now: NaiveDateTime) {
        let settings = self.ctx.settings.clone();
        let current = floor_to_bar(now, settings.benchmark_bar_minutes);
        if self.benchmark_bar == Some(current) {
            return;
        }
        let quotes = self.ctx.quotes.clone();
        let fetched = self
            .bounded(quotes.get_bars(
                &settings.benchmark,
                settings.benchmark_bar_minutes,
                settings.benchmark_lookback_bars,
            ))
            .await;
        match fetched {
            Ok(bars) => {
                self.benchmark = BarSeries::from_bars(
                    bars,
                    settings.benchmark_lookback_bars,
                    settings.benchmark_bar_minutes,
                );
                self.benchmark_bar = Some(current);
            }
            Err(e) => warn!("Benchmark {} unavailable: {}", settings.benchmark, e),
        }
    }

    async fn yesterday_volume(&mut self, today: NaiveDate) -> Option<f64> {
        if let Some((day, volume)) = self.yesterday_volume {
            if day == today {
                return volume;
            }
        }
        let quotes = self.ctx.quotes.clone();
        match self.bounded(quotes.prior_session_volume(&self.instrument)).await {
            Ok(volume) => {
                self.yesterday_volume = Some((today, volume));
                volume
            }
            Err(e) => {
                debug!("Prior session volume for {} unavailable: {}", self.instrument, e);
                None
            }
        }
    }

    /// Mark intents whose fills were published since the last iteration
    fn track_fills(&mut self) {
        loop {
            match self.fills.try_recv() {
                Ok(RunnerEvent::Trade(trade)) if trade.instrument == self.instrument => {
                    if self.intents.get(&trade.order_id).is_some() {
                        let filled = OrderIntentState::Filled { price: trade.price, volume: trade.volume };
                        if let Err(e) = self.intents.update_state(&trade.order_id, filled) {
                            debug!("Intent update skipped: {}", e);
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!("{} runner skipped {} events", self.instrument, skipped);
                }
                Err(_) => break,
            }
        }
    }

    /// Apply the network timeout to a collaborator call
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.ctx.settings.network_timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| RunnerError::Timeout(limit))?
    }
}
