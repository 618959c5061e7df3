//! Historical replay against the vendor REST interface.
//!
//! Two phases per underlying: discover contracts expiring within the DTE
//! horizon of the target date, then page through each contract's trade
//! history for that day. Every fetched trade goes through the identical
//! pipeline as the live stream, tagged with the backfill date. A failed
//! page aborts only its contract; the run keeps going and reports the
//! partial-failure count. Fixed inter-call delays pace the API - a
//! throughput control only, never an ordering guarantee.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::models::{RawTradeEvent, TradeSource};
use crate::pipeline::{PipelineOutcome, TradePipeline};
use crate::validator::MAX_DTE;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const CONTRACTS_PAGE_LIMIT: u32 = 250;
const TRADES_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Default, Clone)]
pub struct BackfillReport {
    pub contracts_discovered: usize,
    pub contracts_processed: usize,
    pub contracts_failed: usize,
    /// Contracts whose pagination hit the page cap: partial results, not
    /// silent truncation.
    pub contracts_capped: usize,
    pub trades_fetched: usize,
    pub trades_accepted: usize,
    pub trades_duplicate: usize,
}

#[derive(Debug, Deserialize)]
struct ContractsPage {
    #[serde(default)]
    results: Vec<ContractRow>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContractRow {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct TradesPage {
    #[serde(default)]
    results: Vec<TradeRow>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    price: f64,
    size: u64,
    /// Nanoseconds since epoch, as the vendor reports trade times.
    sip_timestamp: i64,
}

/// Full-day trade window for `date`, in vendor nanoseconds.
pub fn day_window_ns(date: NaiveDate) -> (i64, i64) {
    let start = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_nanos_opt().unwrap_or(0))
        .unwrap_or(0);
    (start, start + 24 * 3600 * 1_000_000_000)
}

pub struct BackfillOrchestrator {
    client: Client,
    base_url: String,
    api_key: String,
    call_delay: Duration,
    page_cap: u32,
    pipeline: Arc<TradePipeline>,
}

impl BackfillOrchestrator {
    pub fn new(
        base_url: String,
        api_key: String,
        call_delay_ms: u64,
        page_cap: u32,
        pipeline: Arc<TradePipeline>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            api_key,
            call_delay: Duration::from_millis(call_delay_ms),
            page_cap,
            pipeline,
        }
    }

    /// Replay one underlying for one trading day.
    pub async fn run(&self, ticker: &str, date: NaiveDate) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();

        let contracts = self.discover_contracts(ticker, date).await?;
        report.contracts_discovered = contracts.len();
        info!(ticker = %ticker, %date, contracts = contracts.len(), "backfill discovery complete");

        for contract in &contracts {
            sleep(self.call_delay).await;
            match self.replay_contract(contract, date, &mut report).await {
                Ok(()) => report.contracts_processed += 1,
                Err(e) => {
                    warn!(contract = %contract, error = %e, "contract backfill failed; continuing");
                    report.contracts_failed += 1;
                }
            }
        }

        info!(
            ticker = %ticker,
            %date,
            processed = report.contracts_processed,
            failed = report.contracts_failed,
            capped = report.contracts_capped,
            accepted = report.trades_accepted,
            "backfill run finished"
        );
        Ok(report)
    }

    /// Phase 1: contracts for `ticker` expiring within the acceptance
    /// horizon of `date`, following the listing cursor until exhausted.
    async fn discover_contracts(&self, ticker: &str, date: NaiveDate) -> Result<Vec<String>> {
        let horizon_end = date + chrono::Duration::days(MAX_DTE);
        let mut contracts = Vec::new();

        let first_url = format!("{}/v3/reference/options/contracts", self.base_url);
        let mut page: ContractsPage = self
            .get_json(
                &first_url,
                &[
                    ("underlying_ticker", ticker.to_string()),
                    ("expiration_date.gte", date.to_string()),
                    ("expiration_date.lte", horizon_end.to_string()),
                    ("as_of", date.to_string()),
                    ("limit", CONTRACTS_PAGE_LIMIT.to_string()),
                ],
            )
            .await
            .context("contract listing failed")?;

        loop {
            contracts.extend(page.results.into_iter().map(|r| r.ticker));
            let Some(next) = page.next_url else { break };
            sleep(self.call_delay).await;
            page = self
                .get_json(&next, &[])
                .await
                .context("contract listing page failed")?;
        }

        Ok(contracts)
    }

    /// Phase 2: one contract's trades for the day, cursor-paginated up to
    /// the page cap.
    async fn replay_contract(
        &self,
        contract: &str,
        date: NaiveDate,
        report: &mut BackfillReport,
    ) -> Result<()> {
        let (start_ns, end_ns) = day_window_ns(date);
        let first_url = format!("{}/v3/trades/{}", self.base_url, contract);
        let mut next_url: Option<String> = None;
        let mut pages = 0u32;

        loop {
            if pages >= self.page_cap {
                debug!(contract = %contract, pages, "page cap reached; partial results");
                report.contracts_capped += 1;
                return Ok(());
            }

            let page: TradesPage = match &next_url {
                None => {
                    self.get_json(
                        &first_url,
                        &[
                            ("timestamp.gte", start_ns.to_string()),
                            ("timestamp.lt", end_ns.to_string()),
                            ("limit", TRADES_PAGE_LIMIT.to_string()),
                        ],
                    )
                    .await?
                }
                Some(url) => self.get_json(url, &[]).await?,
            };
            pages += 1;

            for row in &page.results {
                report.trades_fetched += 1;
                let raw = RawTradeEvent {
                    contract_code: contract.to_string(),
                    price: row.price,
                    quantity: row.size,
                    exchange_ts_ms: row.sip_timestamp / 1_000_000,
                };
                match self
                    .pipeline
                    .process(&raw, TradeSource::Backfill(date))
                    .await
                {
                    Ok(PipelineOutcome::Accepted) => report.trades_accepted += 1,
                    Ok(PipelineOutcome::Duplicate) => report.trades_duplicate += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(contract = %contract, error = %e, "pipeline error on backfill trade");
                    }
                }
            }

            match page.next_url {
                Some(url) => {
                    next_url = Some(url);
                    sleep(self.call_delay).await;
                }
                None => return Ok(()),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, params: &[(&str, String)]) -> Result<T> {
        let mut request = self.client.get(url).query(&[("apiKey", &self.api_key)]);
        if !params.is_empty() {
            request = request.query(params);
        }
        let response = timeout(CALL_TIMEOUT, request.send())
            .await
            .context("historical call timed out")?
            .context("historical call failed")?
            .error_for_status()
            .context("historical call rejected")?;
        let body = response.json().await.context("historical decode failed")?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_window_covers_whole_day() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let (start, end) = day_window_ns(date);
        assert_eq!(start, 1_767_571_200_000_000_000);
        assert_eq!(end - start, 86_400_000_000_000);
    }

    #[test]
    fn trades_page_decodes_vendor_shape() {
        let body = r#"{
            "results": [
                {"price": 5.25, "size": 40, "sip_timestamp": 1767627000000000000, "conditions": [209]}
            ],
            "next_url": "https://example.test/v3/trades/O:X?cursor=abc"
        }"#;
        let page: TradesPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].size, 40);
        assert_eq!(page.results[0].sip_timestamp / 1_000_000, 1_767_627_000_000);
        assert!(page.next_url.is_some());
    }

    #[test]
    fn contracts_page_tolerates_missing_fields() {
        let page: ContractsPage = serde_json::from_str("{}").unwrap();
        assert!(page.results.is_empty());
        assert!(page.next_url.is_none());
    }
}
