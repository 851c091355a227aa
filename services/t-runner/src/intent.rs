//! Order intent tracking
//!
//! Each runner records what it submitted so a late fill or a retry can be
//! matched against the original decision.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Result, RunnerError, Side};

/// Order intent states
#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntentState {
    Submitted,
    Rejected { reason: String },
    Failed { error: String },
    Filled { price: Decimal, volume: u64 },
}

impl OrderIntentState {
    pub fn is_final(&self) -> bool {
        !matches!(self, OrderIntentState::Submitted)
    }
}

#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub reason: String,
    pub decided_at: NaiveDateTime,
    pub state: OrderIntentState,
    pub created_at: Instant,
}

pub struct IntentRegistry {
    intents: HashMap<Uuid, OrderIntent>,
    max_age: Duration,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
            max_age: Duration::from_secs(3600),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn create(
        &mut self,
        order_id: Uuid,
        instrument: &str,
        side: Side,
        price: Decimal,
        volume: u64,
        reason: &str,
        decided_at: NaiveDateTime,
    ) -> OrderIntent {
        let intent = OrderIntent {
            order_id,
            instrument: instrument.to_string(),
            side,
            price,
            volume,
            reason: reason.to_string(),
            decided_at,
            state: OrderIntentState::Submitted,
            created_at: Instant::now(),
        };
        self.intents.insert(order_id, intent.clone());
        debug!("Created order intent {} for {}", order_id, instrument);
        intent
    }

    pub fn get(&self, order_id: &Uuid) -> Option<&OrderIntent> {
        self.intents.get(order_id)
    }

    pub fn update_state(&mut self, order_id: &Uuid, state: OrderIntentState) -> Result<()> {
        match self.intents.get_mut(order_id) {
            Some(intent) => {
                debug!("Intent {} state: {:?} -> {:?}", order_id, intent.state, state);
                intent.state = state;
                Ok(())
            }
            None => Err(RunnerError::Store(format!("intent not found: {}", order_id))),
        }
    }

    /// Submitted intents still waiting for a fill
    pub fn find_in_flight(&self) -> Vec<&OrderIntent> {
        let mut pending: Vec<&OrderIntent> = self
            .intents
            .values()
            .filter(|intent| !intent.state.is_final())
            .collect();
        pending.sort_by_key(|intent| intent.created_at);
        pending
    }

    /// Drop old intents; long-pending ones are logged on the way out
    pub fn cleanup(&mut self) {
        let before = self.intents.len();
        let max_age = self.max_age;
        self.intents.retain(|id, intent| {
            let keep = intent.created_at.elapsed() < max_age;
            if !keep && !intent.state.is_final() {
                warn!("Dropping intent {} that never saw a fill", id);
            }
            keep
        });
        let after = self.intents.len();
        if before != after {
            debug!("Cleaned up {} old intents", before - after);
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn decided_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    #[test]
    fn test_intent_lifecycle() {
        let mut registry = IntentRegistry::new();
        let order_id = Uuid::new_v4();
        let intent = registry.create(order_id, "600519", Side::Buy, Decimal::TEN, 100, "score 0.7", decided_at());
        assert_eq!(intent.state, OrderIntentState::Submitted);
        assert_eq!(registry.find_in_flight().len(), 1);

        registry
            .update_state(&order_id, OrderIntentState::Filled { price: Decimal::TEN, volume: 100 })
            .unwrap();
        assert!(registry.get(&order_id).unwrap().state.is_final());
        assert!(registry.find_in_flight().is_empty());
    }

    #[test]
    fn test_unknown_intent() {
        let mut registry = IntentRegistry::new();
        let result = registry.update_state(&Uuid::new_v4(), OrderIntentState::Failed { error: "x".into() });
        assert!(result.is_err());
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let mut registry = IntentRegistry::new().with_max_age(Duration::ZERO);
        registry.create(Uuid::new_v4(), "600519", Side::Sell, Decimal::TEN, 100, "", decided_at());
        registry.cleanup();
        assert!(registry.is_empty());
    }
}
