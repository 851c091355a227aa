//! HTTP collaborators: quote service and execution gateway

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::executor::{ExecutionClient, OrderRequest, SubmitAck};
use crate::market::QuoteSource;
use crate::types::{Bar, Fill, Result, RunnerError, Tick};

fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Quote service client
pub struct HttpQuoteSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriorVolumeResponse {
    volume: Option<f64>,
}

impl HttpQuoteSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn failure(response: reqwest::Response, what: &str) -> RunnerError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        RunnerError::Quote(format!("{} failed: {} - {}", what, status, text))
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn get_tick(&self, instrument: &str) -> Result<Option<Tick>> {
        let url = format!("{}/v1/quotes/{}/tick", self.base_url, instrument);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => {
                debug!("No quote for {}", instrument);
                Ok(None)
            }
            _ => Err(Self::failure(response, "Tick fetch").await),
        }
    }

    async fn get_bars(&self, instrument: &str, bar_minutes: u32, count: usize) -> Result<Vec<Bar>> {
        let url = format!("{}/v1/quotes/{}/bars", self.base_url, instrument);
        let response = self
            .client
            .get(&url)
            .query(&[("period", bar_minutes.to_string()), ("count", count.to_string())])
            .send()
            .await?;

        if response.status().is_success() {
            let bars: Vec<Bar> = response.json().await?;
            debug!("Fetched {} bars for {}", bars.len(), instrument);
            Ok(bars)
        } else {
            Err(Self::failure(response, "Bar fetch").await)
        }
    }

    async fn prior_session_volume(&self, instrument: &str) -> Result<Option<f64>> {
        let url = format!("{}/v1/quotes/{}/prior-volume", self.base_url, instrument);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<PriorVolumeResponse>().await?.volume),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::failure(response, "Prior volume fetch").await),
        }
    }
}

/// Execution gateway client
///
/// Orders go out as `POST /v1/orders`; fills are collected by polling
/// `GET /v1/fills?since=` with a moving cursor.
pub struct HttpExecutionClient {
    client: Client,
    base_url: String,
    cursor: Mutex<Option<NaiveDateTime>>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct FillsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<NaiveDateTime>,
}

impl HttpExecutionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            cursor: Mutex::new(None),
        })
    }

    /// Fetch fills reported since the previous poll
    pub async fn poll_fills(&self) -> Result<Vec<Fill>> {
        let mut cursor = self.cursor.lock().await;
        let url = format!("{}/v1/fills", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&FillsQuery { since: *cursor })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RunnerError::Submission(format!("Fill poll failed: {} - {}", status, text)));
        }

        let fills: Vec<Fill> = response.json().await?;
        if let Some(latest) = fills.iter().map(|f| f.timestamp).max() {
            *cursor = Some(latest);
        }
        if !fills.is_empty() {
            debug!("Polled {} fills", fills.len());
        }
        Ok(fills)
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn submit_order(&self, order: &OrderRequest) -> Result<SubmitAck> {
        let url = format!("{}/v1/orders", self.base_url);
        let response = self.client.post(&url).json(order).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RunnerError::Submission(format!("{} - {}", status, text)));
        }

        let body: SubmitResponse = response.json().await?;
        if body.accepted {
            info!("Order {} accepted by gateway", order.order_id);
            Ok(SubmitAck::Accepted)
        } else {
            Ok(SubmitAck::Rejected {
                reason: body.reason.unwrap_or_else(|| "rejected".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let quotes = HttpQuoteSource::new("http://localhost:8080/", Duration::from_secs(3)).unwrap();
        assert_eq!(quotes.base_url, "http://localhost:8080");
        let exec = HttpExecutionClient::new("http://localhost:8081//", Duration::from_secs(3)).unwrap();
        assert_eq!(exec.base_url, "http://localhost:8081");
    }

    #[test]
    fn test_submit_response_parsing() {
        let body: SubmitResponse = serde_json::from_str(r#"{"accepted": false, "reason": "halted"}"#).unwrap();
        assert!(!body.accepted);
        assert_eq!(body.reason.as_deref(), Some("halted"));

        let body: SubmitResponse = serde_json::from_str(r#"{"accepted": true}"#).unwrap();
        assert!(body.accepted);
    }
}
