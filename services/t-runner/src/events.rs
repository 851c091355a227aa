//! Runner events
//!
//! Every evaluation publishes a [`DecisionEvent`]; fills publish trades and
//! closed loops. Subscribers that fall behind lose the oldest events.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{Decision, Verdict};
use crate::regime::Regime;
use crate::trade_loop::TradeLoop;
use crate::types::{Direction, Signal, TradeRecord};

/// Explanation of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub instrument: String,
    pub timestamp: NaiveDateTime,
    pub signal: Signal,
    pub reason: String,
    pub score: Option<f64>,
    pub threshold: Option<f64>,
    pub regime: Option<Regime>,
    pub verdict: Verdict,
}

impl From<&Decision> for DecisionEvent {
    fn from(decision: &Decision) -> Self {
        Self {
            instrument: decision.instrument.clone(),
            timestamp: decision.timestamp,
            signal: decision.signal,
            reason: decision.reason.clone(),
            score: decision.score,
            threshold: decision.threshold,
            regime: decision.regime,
            verdict: decision.verdict.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopClosedEvent {
    pub loop_id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub profit: Decimal,
    pub closed_at: NaiveDateTime,
}

impl LoopClosedEvent {
    pub fn from_loop(trade_loop: &TradeLoop) -> Option<Self> {
        Some(Self {
            loop_id: trade_loop.id,
            instrument: trade_loop.instrument.clone(),
            direction: trade_loop.direction,
            profit: trade_loop.profit?,
            closed_at: trade_loop.close_time?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunnerEvent {
    Decision(DecisionEvent),
    Trade(TradeRecord),
    LoopClosed(LoopClosedEvent),
}

impl RunnerEvent {
    pub fn instrument(&self) -> &str {
        match self {
            RunnerEvent::Decision(e) => &e.instrument,
            RunnerEvent::Trade(t) => &t.instrument,
            RunnerEvent::LoopClosed(e) => &e.instrument,
        }
    }
}

/// Fan-out channel for runner events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunnerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; having none is fine
    pub fn publish(&self, event: RunnerEvent) {
        if self.sender.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let event = DecisionEvent {
            instrument: "600519".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
            signal: Signal::None,
            reason: "no signal".to_string(),
            score: Some(0.4),
            threshold: Some(0.6),
            regime: Some(Regime::Normal),
            verdict: Verdict::NoSignal,
        };
        bus.publish(RunnerEvent::Decision(event.clone()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instrument(), "600519");
        assert_eq!(received, RunnerEvent::Decision(event));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(RunnerEvent::Trade(TradeRecord {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            instrument: "600519".to_string(),
            side: crate::types::Side::Buy,
            price: Decimal::TEN,
            volume: 100,
            amount: Decimal::from(1000),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
            loop_id: Uuid::new_v4(),
        }));
    }

    #[test]
    fn test_open_loop_has_no_closed_event() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let mut trade_loop = TradeLoop::open("600519", Direction::BuyFirst, Decimal::TEN, 100, at);
        assert!(LoopClosedEvent::from_loop(&trade_loop).is_none());

        trade_loop.close(Decimal::new(1010, 2), 100, at);
        let event = LoopClosedEvent::from_loop(&trade_loop).unwrap();
        assert_eq!(event.profit, Decimal::from(10));
    }
}
