//! Underlying reference prices for the OTM decision.
//!
//! One trait, two modes. The live oracle serves the streaming path from a
//! short-TTL snapshot cache so a burst of trades on the same underlying
//! costs one quote fetch, not one per trade. The historical oracle serves
//! replay from cached per-day minute bars with a backward-looking lookup.
//! Both return `None` on any failure; a missing price rejects the trade
//! instead of falling back to a stale or default value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Reference price of `ticker` at (or just before) `at`, or `None`
    /// when no price can be produced.
    async fn reference_price(&self, ticker: &str, at: DateTime<Utc>) -> Option<f64>;
}

#[derive(Debug, Clone, Copy)]
struct PriceSnapshot {
    price: f64,
    fetched_at_ms: i64,
}

impl PriceSnapshot {
    fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.fetched_at_ms <= ttl_ms
    }
}

/// Live-path oracle: most recent traded price, cached per ticker.
pub struct LivePriceOracle {
    client: Client,
    base_url: String,
    api_key: String,
    ttl_ms: i64,
    cache: RwLock<HashMap<String, PriceSnapshot>>,
}

#[derive(Debug, Deserialize)]
struct LastTradeResponse {
    results: Option<LastTradeResult>,
}

#[derive(Debug, Deserialize)]
struct LastTradeResult {
    #[serde(rename = "p")]
    price: f64,
}

impl LivePriceOracle {
    pub fn new(base_url: String, api_key: String, ttl_ms: i64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            api_key,
            ttl_ms,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch_last_trade(&self, ticker: &str) -> anyhow::Result<f64> {
        let url = format!("{}/v2/last/trade/{}", self.base_url, ticker);
        let request = self
            .client
            .get(&url)
            .query(&[("apiKey", self.api_key.as_str())])
            .send();
        let response = timeout(FETCH_TIMEOUT, request).await??.error_for_status()?;
        let body: LastTradeResponse = response.json().await?;
        body.results
            .map(|r| r.price)
            .ok_or_else(|| anyhow::anyhow!("no last trade for {ticker}"))
    }
}

#[async_trait]
impl PriceOracle for LivePriceOracle {
    async fn reference_price(&self, ticker: &str, _at: DateTime<Utc>) -> Option<f64> {
        let now_ms = Utc::now().timestamp_millis();

        if let Some(snap) = self.cache.read().get(ticker) {
            if snap.is_fresh(now_ms, self.ttl_ms) {
                return Some(snap.price);
            }
        }

        // No lock held across the fetch; concurrent refreshes for the same
        // ticker are last-writer-wins.
        match self.fetch_last_trade(ticker).await {
            Ok(price) => {
                self.cache.write().insert(
                    ticker.to_string(),
                    PriceSnapshot {
                        price,
                        fetched_at_ms: now_ms,
                    },
                );
                Some(price)
            }
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "live quote fetch failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteBar {
    pub ts_ms: i64,
    pub close: f64,
}

/// Close of the latest bar whose timestamp is not after `ts_ms`. Bars must
/// be ascending by timestamp, as the vendor returns them.
pub fn latest_close_not_after(bars: &[MinuteBar], ts_ms: i64) -> Option<f64> {
    let idx = bars.partition_point(|b| b.ts_ms <= ts_ms);
    idx.checked_sub(1).map(|i| bars[i].close)
}

/// Replay-path oracle: per-(ticker, day) minute bars, fetched once and
/// looked up backward-nearest.
pub struct HistoricalPriceOracle {
    client: Client,
    base_url: String,
    api_key: String,
    bars: RwLock<HashMap<(String, NaiveDate), Arc<Vec<MinuteBar>>>>,
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    results: Option<Vec<AggBar>>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    #[serde(rename = "t")]
    ts_ms: i64,
    #[serde(rename = "c")]
    close: f64,
}

impl HistoricalPriceOracle {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            api_key,
            bars: RwLock::new(HashMap::new()),
        }
    }

    async fn day_bars(&self, ticker: &str, date: NaiveDate) -> Option<Arc<Vec<MinuteBar>>> {
        let key = (ticker.to_string(), date);
        if let Some(bars) = self.bars.read().get(&key) {
            return Some(bars.clone());
        }

        let url = format!(
            "{}/v2/aggs/ticker/{}/range/1/minute/{}/{}",
            self.base_url, ticker, date, date
        );
        let request = self
            .client
            .get(&url)
            .query(&[("limit", "50000"), ("apiKey", self.api_key.as_str())])
            .send();
        let response = match timeout(FETCH_TIMEOUT, request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(ticker = %ticker, %date, error = %e, "minute bar fetch failed");
                return None;
            }
            Err(_) => {
                warn!(ticker = %ticker, %date, "minute bar fetch timed out");
                return None;
            }
        };
        let body: AggsResponse = match response.error_for_status().map(|r| r.json()) {
            Ok(fut) => match fut.await {
                Ok(body) => body,
                Err(e) => {
                    warn!(ticker = %ticker, %date, error = %e, "minute bar decode failed");
                    return None;
                }
            },
            Err(e) => {
                warn!(ticker = %ticker, %date, error = %e, "minute bar fetch rejected");
                return None;
            }
        };

        let mut bars: Vec<MinuteBar> = body
            .results
            .unwrap_or_default()
            .into_iter()
            .map(|b| MinuteBar {
                ts_ms: b.ts_ms,
                close: b.close,
            })
            .collect();
        bars.sort_by_key(|b| b.ts_ms);
        debug!(ticker = %ticker, %date, bars = bars.len(), "minute bars cached");

        let bars = Arc::new(bars);
        self.bars.write().insert(key, bars.clone());
        Some(bars)
    }
}

#[async_trait]
impl PriceOracle for HistoricalPriceOracle {
    async fn reference_price(&self, ticker: &str, at: DateTime<Utc>) -> Option<f64> {
        let bars = self.day_bars(ticker, at.date_naive()).await?;
        latest_close_not_after(&bars, at.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_freshness_respects_ttl() {
        let snap = PriceSnapshot {
            price: 100.0,
            fetched_at_ms: 10_000,
        };
        assert!(snap.is_fresh(14_000, 5_000));
        assert!(snap.is_fresh(15_000, 5_000));
        assert!(!snap.is_fresh(15_001, 5_000));
    }

    #[test]
    fn backward_looking_bar_lookup() {
        let bars = vec![
            MinuteBar { ts_ms: 60_000, close: 100.0 },
            MinuteBar { ts_ms: 120_000, close: 101.0 },
            MinuteBar { ts_ms: 180_000, close: 99.5 },
        ];

        // Before the first bar: no price rather than a forward-looking one.
        assert_eq!(latest_close_not_after(&bars, 59_999), None);
        // Exact bar boundary matches that bar.
        assert_eq!(latest_close_not_after(&bars, 60_000), Some(100.0));
        // Mid-minute matches the bar at or before the timestamp.
        assert_eq!(latest_close_not_after(&bars, 179_000), Some(101.0));
        // After the last bar: latest close.
        assert_eq!(latest_close_not_after(&bars, 500_000), Some(99.5));
    }

    #[test]
    fn empty_bars_yield_none() {
        assert_eq!(latest_close_not_after(&[], 1_000), None);
    }
}
