//! T Runner - intraday T-trading agent
//!
//! 1. Loads settings and per-instrument strategy configs
//! 2. Clears execution locks left by a previous process
//! 3. Starts one polling task per instrument
//! 4. Applies fills as they arrive and sweeps expired locks

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use t_runner::client::{HttpExecutionClient, HttpQuoteSource};
use t_runner::clock::{Clock, SystemClock};
use t_runner::config::StrategyBook;
use t_runner::engine::DecisionEngine;
use t_runner::events::EventBus;
use t_runner::executor::{ExecutionClient, PaperExecutor};
use t_runner::fills::FillHandler;
use t_runner::indicators::IndicatorParams;
use t_runner::reconciler::LockReconciler;
use t_runner::runner::RunnerContext;
use t_runner::settings::{RunnerSettings, TradingMode};
use t_runner::state::JsonFileStore;
use t_runner::store::StateStore;
use t_runner::supervisor::{spawn_fill_poller, spawn_fill_pump, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("T_RUNNER_SETTINGS").ok());
    let settings = RunnerSettings::load(settings_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_max_level(
            settings
                .log_level
                .parse::<tracing::Level>()
                .unwrap_or(tracing::Level::INFO),
        )
        .init();

    info!("Starting T Runner in {:?} mode...", settings.mode);
    info!("State directory: {}", settings.state_dir.display());
    let settings = Arc::new(settings);

    let store = Arc::new(JsonFileStore::new(&settings.state_dir));
    store.init().await?;
    if let Some(path) = &settings.strategy_file {
        let book = StrategyBook::load(path).await?;
        for config in &book.strategies {
            store.save_config(config).await?;
        }
        info!("Loaded {} strategy configs from {}", book.strategies.len(), path.display());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(settings.exchange_utc_offset_hours)?);
    let quotes = Arc::new(HttpQuoteSource::new(&settings.quote_url, settings.network_timeout())?);
    let events = EventBus::default();
    let fill_handler = Arc::new(FillHandler::new(store.clone(), events.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (executor, fill_task): (Arc<dyn ExecutionClient>, JoinHandle<()>) = match settings.mode {
        TradingMode::Paper => {
            let (executor, fills) = PaperExecutor::new(clock.clone());
            let executor: Arc<dyn ExecutionClient> = Arc::new(executor);
            (executor, spawn_fill_pump(fills, fill_handler.clone()))
        }
        TradingMode::Live => {
            let client = Arc::new(HttpExecutionClient::new(
                &settings.execution_url,
                settings.network_timeout(),
            )?);
            let poller = client.clone();
            let task = spawn_fill_poller(
                settings.poll_interval(),
                shutdown_rx.clone(),
                fill_handler.clone(),
                move || {
                    let poller = poller.clone();
                    async move { poller.poll_fills().await }
                },
            );
            let executor: Arc<dyn ExecutionClient> = client;
            (executor, task)
        }
    };

    // Nothing can be in flight before the first runner starts
    let reconciler = LockReconciler::new(store.clone(), clock.clone(), settings.lock_lease())
        .with_interval(settings.lock_sweep_interval());
    reconciler.reset_on_startup().await?;
    let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let ctx = RunnerContext {
        settings: settings.clone(),
        engine: DecisionEngine::new(
            IndicatorParams::default(),
            settings.benchmark_bar_minutes,
            settings.lot_size,
        ),
        quotes,
        executor,
        store: store.clone(),
        clock,
        events,
    };
    let mut supervisor = Supervisor::new(ctx);

    let instruments = if settings.instruments.is_empty() {
        store.instruments().await?
    } else {
        settings.instruments.clone()
    };
    if instruments.is_empty() {
        warn!("No instruments configured; waiting for shutdown");
    }
    for instrument in &instruments {
        if store.load_config(instrument).await?.is_none() {
            warn!("{} has no strategy config, its runner will back off until one is saved", instrument);
        }
        supervisor.start(instrument).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    supervisor.stop_all().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_task.await {
        warn!("Lock reconciler ended abnormally: {}", e);
    }
    fill_task.abort();

    info!("T Runner stopped");
    Ok(())
}
