//! The shared ingest path.
//!
//! Both the live stream and historical backfill drive every trade through
//! this one pipeline (decode, reference price, validate, persist,
//! aggregate), so the two paths cannot disagree on filtering decisions.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::aggregation::AggregationEngine;
use crate::contract::parse_contract_code;
use crate::models::{Config, RawTradeEvent, TradeSource};
use crate::oracle::PriceOracle;
use crate::storage::TradeStore;
use crate::validator::{RejectReason, TradeValidator, Verdict};

#[derive(Debug)]
pub enum PipelineOutcome {
    /// Persisted and aggregated.
    Accepted,
    /// Already seen (overlapping live/backfill window); nothing changed.
    Duplicate,
    Rejected(RejectReason),
    ParseFailed,
}

pub struct TradePipeline {
    validator: TradeValidator,
    oracle: Arc<dyn PriceOracle>,
    store: TradeStore,
    engine: Arc<AggregationEngine>,
}

impl TradePipeline {
    pub fn new(
        config: &Config,
        oracle: Arc<dyn PriceOracle>,
        store: TradeStore,
        engine: Arc<AggregationEngine>,
    ) -> Self {
        Self {
            validator: TradeValidator::new(config.watchlist.clone(), config.min_premium),
            oracle,
            store,
            engine,
        }
    }

    /// Run one raw trade through the full path.
    ///
    /// Parse failures and validation rejections are expected outcomes, not
    /// errors; only a persistence fault returns `Err`.
    pub async fn process(&self, raw: &RawTradeEvent, source: TradeSource) -> Result<PipelineOutcome> {
        let contract = match parse_contract_code(&raw.contract_code) {
            Ok(c) => c,
            Err(e) => {
                debug!(code = %raw.contract_code, error = %e, "contract parse failed");
                return Ok(PipelineOutcome::ParseFailed);
            }
        };

        // Every decodable event moves the ticker's watermark, accepted or
        // not. An all-rejected window still reads as processed instead of
        // looking identical to a window nobody ever ingested.
        self.engine
            .note_processed(&contract.underlying, raw.exchange_ts_ms);

        // Observation time is the exchange timestamp on both paths, so a
        // replay reproduces the live decision exactly.
        let observed_at = DateTime::<Utc>::from_timestamp_millis(raw.exchange_ts_ms)
            .unwrap_or_else(Utc::now);

        let reference = self
            .oracle
            .reference_price(&contract.underlying, observed_at)
            .await;

        let trade = match self.validator.evaluate(
            &contract,
            &raw.contract_code,
            raw.price,
            raw.quantity,
            raw.exchange_ts_ms,
            observed_at,
            reference,
            source,
        ) {
            Verdict::Accept(trade) => trade,
            Verdict::Reject(reason) => return Ok(PipelineOutcome::Rejected(reason)),
        };

        let inserted = self
            .store
            .insert(&trade)
            .with_context(|| format!("failed to persist trade {}", trade.contract_code))?;

        // Aggregation is a best-effort derived view; a duplicate there is
        // fine and nothing about it can roll back the persisted row. Called
        // even for store-duplicates so a restarted engine heals on replay.
        let applied = self.engine.update(
            &trade.underlying,
            trade.exchange_ts_ms,
            trade.option_type,
            trade.premium,
            &trade.dedup_key(),
        );
        if inserted && !applied {
            warn!(contract = %trade.contract_code, "trade persisted but bucket already counted it");
        }

        if inserted {
            debug!(
                contract = %trade.contract_code,
                premium = trade.premium,
                source = %trade.source,
                "trade accepted"
            );
            Ok(PipelineOutcome::Accepted)
        } else {
            Ok(PipelineOutcome::Duplicate)
        }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn store(&self) -> &TradeStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionType;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct ScriptedOracle {
        prices: HashMap<String, f64>,
    }

    #[async_trait]
    impl PriceOracle for ScriptedOracle {
        async fn reference_price(&self, ticker: &str, _at: DateTime<Utc>) -> Option<f64> {
            self.prices.get(ticker).copied()
        }
    }

    fn test_config() -> Config {
        Config {
            database_path: String::new(),
            api_key: String::new(),
            ws_url: String::new(),
            rest_base_url: String::new(),
            watchlist: vec!["TSLA".to_string()],
            min_premium: 25_000.0,
            price_cache_ttl_ms: 5_000,
            backfill_page_cap: 10,
            backfill_call_delay_ms: 0,
            retention_hours: 72,
        }
    }

    fn pipeline_with(prices: &[(&str, f64)]) -> (TradePipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            TradeStore::new(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let oracle = Arc::new(ScriptedOracle {
            prices: prices
                .iter()
                .map(|(t, p)| (t.to_string(), *p))
                .collect(),
        });
        let engine = Arc::new(AggregationEngine::new());
        (
            TradePipeline::new(&test_config(), oracle, store, engine),
            dir,
        )
    }

    // 2026-01-05T15:30:00Z; the matching contract expires 2026-01-16.
    const TS_MS: i64 = 1_767_627_000_000;

    fn raw(code: &str, price: f64, qty: u64) -> RawTradeEvent {
        RawTradeEvent {
            contract_code: code.to_string(),
            price,
            quantity: qty,
            exchange_ts_ms: TS_MS,
        }
    }

    #[tokio::test]
    async fn accepted_trade_is_persisted_and_aggregated() {
        let (pipeline, _dir) = pipeline_with(&[("TSLA", 280.0)]);
        let event = raw("O:TSLA260116C00300000", 5.0, 100);

        let outcome = pipeline.process(&event, TradeSource::Live).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Accepted));

        assert_eq!(pipeline.store().trade_count().unwrap(), 1);
        let buckets = pipeline
            .engine()
            .read_range("TSLA", TS_MS - 60_000, TS_MS + 60_000);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].call_premium, 50_000.0);
        assert_eq!(buckets[0].call_count, 1);
    }

    #[tokio::test]
    async fn duplicate_event_does_not_double_count() {
        let (pipeline, _dir) = pipeline_with(&[("TSLA", 280.0)]);
        let event = raw("O:TSLA260116C00300000", 5.0, 100);

        pipeline.process(&event, TradeSource::Live).await.unwrap();
        let date = DateTime::<Utc>::from_timestamp_millis(TS_MS)
            .unwrap()
            .date_naive();
        let outcome = pipeline
            .process(&event, TradeSource::Backfill(date))
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Duplicate));

        assert_eq!(pipeline.store().trade_count().unwrap(), 1);
        let buckets = pipeline
            .engine()
            .read_range("TSLA", TS_MS - 60_000, TS_MS + 60_000);
        assert_eq!(buckets[0].call_count, 1);
    }

    #[tokio::test]
    async fn malformed_code_is_dropped_not_fatal() {
        let (pipeline, _dir) = pipeline_with(&[("TSLA", 280.0)]);
        let event = raw("garbage", 5.0, 100);
        let outcome = pipeline.process(&event, TradeSource::Live).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::ParseFailed));
        assert_eq!(pipeline.store().trade_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn price_unavailable_rejects() {
        let (pipeline, _dir) = pipeline_with(&[]);
        let event = raw("O:TSLA260116C00300000", 5.0, 100);
        let outcome = pipeline.process(&event, TradeSource::Live).await.unwrap();
        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::PriceUnavailable)
        ));
    }

    #[tokio::test]
    async fn itm_contract_rejects() {
        let (pipeline, _dir) = pipeline_with(&[("TSLA", 320.0)]);
        let event = raw("O:TSLA260116C00300000", 5.0, 100);
        let outcome = pipeline.process(&event, TradeSource::Live).await.unwrap();
        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::InTheMoney)
        ));
    }

    #[tokio::test]
    async fn rejected_only_window_still_advances_watermark() {
        // Reference 320 puts every strike-300 call in the money, so the
        // whole window is rejected. The watermark must still show the
        // window as processed.
        let (pipeline, _dir) = pipeline_with(&[("TSLA", 320.0)]);

        for i in 0..10i64 {
            let mut event = raw("O:TSLA260116C00300000", 5.0, 100);
            event.exchange_ts_ms = TS_MS + i * 60_000;
            let outcome = pipeline.process(&event, TradeSource::Live).await.unwrap();
            assert!(matches!(
                outcome,
                PipelineOutcome::Rejected(RejectReason::InTheMoney)
            ));
        }

        assert_eq!(
            pipeline.engine().watermark("TSLA"),
            Some(TS_MS + 9 * 60_000)
        );
        assert!(pipeline
            .engine()
            .read_range("TSLA", 0, i64::MAX)
            .is_empty());
        assert_eq!(pipeline.store().trade_count().unwrap(), 0);
    }
}
