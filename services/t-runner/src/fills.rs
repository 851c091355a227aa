//! Fill handling
//!
//! Runs out of band, once per acknowledged fill: updates the account, drives
//! the loop transition, journals the trade and finally releases the lock.
//! The journal entry is written last and marks the fill as applied.

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, LoopClosedEvent, RunnerEvent};
use crate::portfolio::PositionAccount;
use crate::store::StateStore;
use crate::trade_loop::{LoopState, Transition};
use crate::types::{Fill, Result, TradeRecord};

/// What a fill did to the instrument
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Applied { trade: TradeRecord, transition: Transition },
    /// Already seen this order id
    Duplicate,
}

pub struct FillHandler {
    store: Arc<dyn StateStore>,
    events: EventBus,
    seen: Mutex<HashSet<Uuid>>,
}

impl FillHandler {
    pub fn new(store: Arc<dyn StateStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub async fn on_fill(&self, fill: Fill) -> Result<FillOutcome> {
        let mut seen = self.seen.lock().await;
        if seen.contains(&fill.order_id) || self.journaled(&fill).await? {
            debug!("Ignoring duplicate fill for order {}", fill.order_id);
            return Ok(FillOutcome::Duplicate);
        }

        let instrument = fill.instrument.as_str();
        let mut account = self.store.load_account(instrument).await?;
        let stored = account.clone();
        account.roll_session(fill.timestamp.date());

        if let Err(e) = account.validate_fill(&fill) {
            warn!("❌ Fill {} on {} rejected: {}", fill.order_id, instrument, e);
            self.release(&fill).await;
            return Err(e);
        }

        let mut state = LoopState::from_open_loop(self.store.open_loop(instrument).await?);
        let transition = match state.apply_fill(&fill) {
            Ok(transition) => transition,
            Err(e) => {
                warn!("❌ Fill {} on {} does not fit the open loop: {}", fill.order_id, instrument, e);
                self.release(&fill).await;
                return Err(e);
            }
        };
        account.apply_fill(&fill)?;

        let trade_loop = match &transition {
            Transition::Opened(l) | Transition::Closed(l) => l,
        };
        let trade = TradeRecord {
            id: Uuid::new_v4(),
            order_id: fill.order_id,
            instrument: fill.instrument.clone(),
            side: fill.side,
            price: fill.price,
            volume: fill.volume,
            amount: fill.price * Decimal::from(fill.volume),
            timestamp: fill.timestamp,
            loop_id: trade_loop.id,
        };

        // A storage failure leaves the lock to expire rather than letting the
        // next tick trade on a half-written state.
        self.store.save_account(instrument, &account).await?;
        if let Err(e) = self.store.save_loop(trade_loop).await {
            self.restore_account(instrument, &stored).await;
            return Err(e);
        }
        // Account and loop are in place, a redelivery must not apply them twice
        seen.insert(fill.order_id);
        drop(seen);
        if let Err(e) = self.store.append_trade(&trade).await {
            error!("Fill {} applied but its trade was not journaled: {}", fill.order_id, e);
            return Err(e);
        }

        self.release(&fill).await;

        info!(
            "✅ Fill {} {} {} @ {} applied to loop {}",
            instrument, fill.side, fill.volume, fill.price, trade_loop.id
        );
        self.events.publish(RunnerEvent::Trade(trade.clone()));
        if let Transition::Closed(closed) = &transition {
            if let Some(event) = LoopClosedEvent::from_loop(closed) {
                self.events.publish(RunnerEvent::LoopClosed(event));
            }
        }

        Ok(FillOutcome::Applied { trade, transition })
    }

    async fn journaled(&self, fill: &Fill) -> Result<bool> {
        Ok(self
            .store
            .trades(&fill.instrument)
            .await?
            .iter()
            .any(|t| t.order_id == fill.order_id))
    }

    async fn restore_account(&self, instrument: &str, stored: &PositionAccount) {
        if let Err(e) = self.store.save_account(instrument, stored).await {
            error!("Failed to restore the {} account after a partial fill write: {}", instrument, e);
        }
    }

    async fn release(&self, fill: &Fill) {
        match self.store.release_lock(&fill.instrument, fill.order_id).await {
            Ok(true) => debug!("🔑 Lock on {} released by order {}", fill.instrument, fill.order_id),
            Ok(false) => debug!("Order {} no longer holds the {} lock", fill.order_id, fill.instrument),
            Err(e) => error!("Failed to release lock on {}: {}", fill.instrument, e),
        }
    }
}
