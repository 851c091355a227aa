//! Cross-module tests for t-runner

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::clock::FixedClock;
    use crate::config::{StrategyBook, StrategyKind};
    use crate::engine::DecisionEngine;
    use crate::events::EventBus;
    use crate::executor::PaperExecutor;
    use crate::fills::FillHandler;
    use crate::indicators::IndicatorParams;
    use crate::market::MemoryQuoteSource;
    use crate::runner::{InstrumentRunner, RunnerContext, TickOutcome};
    use crate::settings::RunnerSettings;
    use crate::state::JsonFileStore;
    use crate::store::StateStore;
    use crate::types::{Bar, Side, Tick};

    const BOOK: &str = r#"
strategies:
  - instrument: "600519"
    strategy: percentage
    market_filter_enabled: false
    buy_shares: 200
"#;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 30, 0).unwrap()
    }

    /// Yesterday's close at 10.00, then an hour flat at 10.00
    fn history() -> Vec<Bar> {
        let start = now() - Duration::minutes(60);
        let mut bars = vec![Bar {
            timestamp: start - Duration::days(1) + Duration::hours(5),
            open: 10.0,
            high: 10.0,
            low: 10.0,
            close: 10.0,
            volume: 1000.0,
            amount: 0.0,
        }];
        bars.extend((0..60).map(|i| Bar {
            timestamp: start + Duration::minutes(i),
            open: 10.0,
            high: 10.02,
            low: 9.98,
            close: 10.0,
            volume: 1000.0,
            amount: 0.0,
        }));
        bars
    }

    fn tick(close: f64) -> Tick {
        Tick { timestamp: now(), open: 10.0, high: 10.02, low: close, close, volume: 1500.0, amount: 0.0 }
    }

    #[tokio::test]
    async fn test_book_to_fill_on_file_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        store.init().await.unwrap();
        for config in &StrategyBook::from_yaml_str(BOOK).unwrap().strategies {
            store.save_config(config).await.unwrap();
        }

        let clock = Arc::new(FixedClock::new(now()));
        let quotes = Arc::new(MemoryQuoteSource::new());
        quotes.set_bars("600519", history()).await;
        quotes.set_tick("600519", tick(9.9)).await;

        let (executor, mut fills) = PaperExecutor::new(clock.clone());
        let executor = executor.with_fill_delay(std::time::Duration::ZERO, std::time::Duration::ZERO);
        let events = EventBus::default();
        let ctx = RunnerContext {
            settings: Arc::new(RunnerSettings::default()),
            engine: DecisionEngine::new(IndicatorParams::default(), 5, 100),
            quotes,
            executor: Arc::new(executor),
            store: store.clone(),
            clock,
            events: events.clone(),
        };
        let mut runner = InstrumentRunner::new("600519", ctx);

        // 9.90 is 1% under yesterday's close
        let outcome = runner.run_once().await.unwrap();
        let TickOutcome::Submitted { order, .. } = outcome else {
            panic!("expected a submission, got {:?}", outcome);
        };
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.volume, 200);
        assert!(store.lock_status("600519").await.unwrap().is_some());

        // lock stays until the fill lands
        assert_eq!(runner.run_once().await.unwrap(), TickOutcome::LockHeld);

        let handler = FillHandler::new(store.clone(), events);
        handler.on_fill(fills.recv().await.unwrap()).await.unwrap();

        assert!(store.lock_status("600519").await.unwrap().is_none());
        let open = store.open_loop("600519").await.unwrap().unwrap();
        assert_eq!(open.open_price, Decimal::new(990, 2));
        assert_eq!(store.trades("600519").await.unwrap().len(), 1);
        assert_eq!(store.load_account("600519").await.unwrap().balance, Decimal::from(98_020));

        // the runner sees the fill on its next pass
        let outcome = runner.run_once().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Evaluated(_)));
        assert!(runner.intents().find_in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_paused_instrument_evaluates_but_never_locks() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let mut config = StrategyBook::from_yaml_str(BOOK).unwrap().strategies.remove(0);
        config.active = false;
        assert_eq!(config.strategy, StrategyKind::Percentage);
        store.save_config(&config).await.unwrap();

        let clock = Arc::new(FixedClock::new(now()));
        let quotes = Arc::new(MemoryQuoteSource::new());
        quotes.set_bars("600519", history()).await;
        quotes.set_tick("600519", tick(9.9)).await;
        let (executor, _fills) = PaperExecutor::new(clock.clone());

        let mut runner = InstrumentRunner::new(
            "600519",
            RunnerContext {
                settings: Arc::new(RunnerSettings::default()),
                engine: DecisionEngine::new(IndicatorParams::default(), 5, 100),
                quotes,
                executor: Arc::new(executor),
                store: store.clone(),
                clock,
                events: EventBus::default(),
            },
        );

        assert!(matches!(runner.run_once().await.unwrap(), TickOutcome::Inactive(_)));
        assert!(store.lock_status("600519").await.unwrap().is_none());
    }
}
