//! Order execution interface and the paper executor
//!
//! `submit_order` only acknowledges receipt. Fills arrive later, out of band,
//! on the channel handed out when the executor is built.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::types::{Fill, Result, Side};

/// Order sent to the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub submitted_at: NaiveDateTime,
}

/// Receipt acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SubmitAck {
    Accepted,
    Rejected { reason: String },
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit_order(&self, order: &OrderRequest) -> Result<SubmitAck>;
}

/// Simulated executor: accepts well-formed orders and fills them in full at
/// the order price after a short random delay.
pub struct PaperExecutor {
    fills: mpsc::UnboundedSender<Fill>,
    clock: Arc<dyn Clock>,
    min_delay: Duration,
    max_delay: Duration,
}

impl PaperExecutor {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<Fill>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Self {
            fills: tx,
            clock,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1500),
        };
        (executor, rx)
    }

    /// Set fill latency bounds
    pub fn with_fill_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max.max(min);
        self
    }
}

#[async_trait]
impl ExecutionClient for PaperExecutor {
    async fn submit_order(&self, order: &OrderRequest) -> Result<SubmitAck> {
        if order.volume == 0 || order.price <= Decimal::ZERO {
            warn!("📝 Paper order {} rejected: volume {} price {}", order.order_id, order.volume, order.price);
            return Ok(SubmitAck::Rejected {
                reason: "invalid volume or price".to_string(),
            });
        }

        let delay = if self.max_delay > self.min_delay {
            rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
        } else {
            self.min_delay
        };

        info!(
            "📝 Paper order {} accepted: {} {} {} @ {} (fill in {:?})",
            order.order_id, order.instrument, order.side, order.volume, order.price, delay
        );

        let fills = self.fills.clone();
        let clock = self.clock.clone();
        let order = order.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fill = Fill {
                order_id: order.order_id,
                instrument: order.instrument,
                side: order.side,
                price: order.price,
                volume: order.volume,
                timestamp: clock.now(),
            };
            if fills.send(fill).is_err() {
                debug!("Fill receiver dropped, paper fill for {} discarded", order.order_id);
            }
        });

        Ok(SubmitAck::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::NaiveDate;

    fn order(volume: u64) -> OrderRequest {
        OrderRequest {
            order_id: Uuid::new_v4(),
            instrument: "600519".to_string(),
            side: Side::Buy,
            price: Decimal::TEN,
            volume,
            submitted_at: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_paper_fill_delivered() {
        let clock = Arc::new(FixedClock::new(order(100).submitted_at));
        let (executor, mut fills) = PaperExecutor::new(clock);
        let executor = executor.with_fill_delay(Duration::from_millis(1), Duration::from_millis(5));

        let request = order(100);
        assert_eq!(executor.submit_order(&request).await.unwrap(), SubmitAck::Accepted);

        let fill = fills.recv().await.unwrap();
        assert_eq!(fill.order_id, request.order_id);
        assert_eq!(fill.volume, 100);
        assert_eq!(fill.price, Decimal::TEN);
    }

    #[tokio::test]
    async fn test_paper_rejects_zero_volume() {
        let clock = Arc::new(FixedClock::new(order(0).submitted_at));
        let (executor, _fills) = PaperExecutor::new(clock);
        let ack = executor.submit_order(&order(0)).await.unwrap();
        assert!(matches!(ack, SubmitAck::Rejected { .. }));
    }
}
