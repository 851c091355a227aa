//! T Runner Library
//!
//! Intraday T-trading: a synchronous decision engine (indicators, factor
//! score, market regime, loop state, sizing) wrapped in a per-instrument
//! execution pipeline guarded by a lease-based execution lock.

pub mod bars;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod fills;
pub mod indicators;
pub mod intent;
pub mod market;
pub mod portfolio;
pub mod reconciler;
pub mod regime;
pub mod replay;
pub mod runner;
pub mod scorer;
pub mod settings;
pub mod sizing;
pub mod state;
pub mod store;
pub mod strategy;
pub mod supervisor;
pub mod trade_loop;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use config::{StrategyBook, StrategyConfig, StrategyKind};
pub use engine::{Decision, DecisionEngine, DecisionInput, PlannedOrder, Verdict};
pub use events::{DecisionEvent, EventBus, RunnerEvent};
pub use executor::{ExecutionClient, OrderRequest, PaperExecutor, SubmitAck};
pub use fills::{FillHandler, FillOutcome};
pub use market::{MemoryQuoteSource, QuoteSource};
pub use portfolio::PositionAccount;
pub use regime::{Regime, RegimeAssessment};
pub use runner::{InstrumentRunner, RunnerContext, TickOutcome};
pub use settings::{RunnerSettings, TradingMode};
pub use state::JsonFileStore;
pub use store::{LockLease, MemoryStore, StateStore};
pub use supervisor::Supervisor;
pub use trade_loop::{LoopState, TradeLoop};
pub use types::{Bar, Direction, Fill, RunnerError, Side, Signal, Tick, TradeRecord};
