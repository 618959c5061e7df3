//! Per-(ticker, minute) premium aggregation.
//!
//! Buckets live in memory as a derived view over persisted trades: created
//! lazily on the first accepted trade in a minute, mutated additively, and
//! swept by retention. Locking is per bucket so the live stream and an
//! overlapping backfill never contend unless they hit the same key, and
//! same-key writers serialize without lost updates. Updates are keyed by a
//! deduplicated trade key, so replaying an overlapping window is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::models::OptionType;

pub const MINUTE_MS: i64 = 60_000;

/// Truncate a millisecond timestamp to its minute boundary.
pub fn align_to_minute(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(MINUTE_MS)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    ticker: String,
    minute_ms: i64,
}

#[derive(Debug, Clone, Default)]
struct TimeBucket {
    call_premium: f64,
    put_premium: f64,
    call_count: u64,
    put_count: u64,
    last_updated_ms: i64,
}

/// Read-side view of one minute bucket. Net flow is derived here, never
/// stored, so it cannot drift from its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub minute_ms: i64,
    pub call_premium: f64,
    pub put_premium: f64,
    pub call_count: u64,
    pub put_count: u64,
    pub last_updated_ms: i64,
}

impl BucketSnapshot {
    pub fn net_premium(&self) -> f64 {
        self.call_premium - self.put_premium
    }

    pub fn trade_count(&self) -> u64 {
        self.call_count + self.put_count
    }
}

#[derive(Default)]
pub struct AggregationEngine {
    buckets: RwLock<HashMap<BucketKey, Arc<Mutex<TimeBucket>>>>,
    /// Dedup key -> bucket minute, so the sweep can evict old keys.
    seen: Mutex<HashMap<String, i64>>,
    /// Latest minute processed per ticker, from either ingest path and
    /// regardless of whether the trade survived filtering. Lets consumers
    /// tell "never processed" from "processed, zero accepted trades".
    watermarks: RwLock<HashMap<String, i64>>,
}

impl AggregationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one accepted trade into its minute bucket.
    ///
    /// Returns false when `dedup_key` was already applied; the bucket is
    /// left untouched in that case.
    pub fn update(
        &self,
        ticker: &str,
        exchange_ts_ms: i64,
        option_type: OptionType,
        premium: f64,
        dedup_key: &str,
    ) -> bool {
        let minute_ms = align_to_minute(exchange_ts_ms);
        let key = BucketKey {
            ticker: ticker.to_string(),
            minute_ms,
        };

        // The dedup insert and the bucket write both happen under the map
        // read lock. A retention sweep takes the write lock, so it can
        // never remove the bucket between the two and leave the key in
        // `seen` pointing at an orphaned bucket.
        loop {
            let map = self.buckets.read();
            let Some(bucket) = map.get(&key) else {
                drop(map);
                self.buckets.write().entry(key.clone()).or_default();
                continue;
            };

            {
                let mut seen = self.seen.lock();
                if seen.contains_key(dedup_key) {
                    return false;
                }
                seen.insert(dedup_key.to_string(), minute_ms);
            }

            let mut b = bucket.lock();
            match option_type {
                OptionType::Call => {
                    b.call_premium += premium;
                    b.call_count += 1;
                }
                OptionType::Put => {
                    b.put_premium += premium;
                    b.put_count += 1;
                }
            }
            b.last_updated_ms = Utc::now().timestamp_millis();
            break;
        }

        self.advance_watermark(ticker, minute_ms);
        true
    }

    /// Record that an event for `ticker` was fully processed even when the
    /// trade was rejected, so an all-rejected window still reads as
    /// processed rather than never seen.
    pub fn note_processed(&self, ticker: &str, exchange_ts_ms: i64) {
        self.advance_watermark(ticker, align_to_minute(exchange_ts_ms));
    }

    fn advance_watermark(&self, ticker: &str, minute_ms: i64) {
        let mut marks = self.watermarks.write();
        let mark = marks.entry(ticker.to_string()).or_insert(minute_ms);
        *mark = (*mark).max(minute_ms);
    }

    /// All buckets for `ticker` with minute in `[start_ms, end_ms)`,
    /// ordered by minute. Callers compute cumulative sums by walking the
    /// result; only per-minute deltas are stored, so late backfilled
    /// minutes never force rewriting later buckets.
    pub fn read_range(&self, ticker: &str, start_ms: i64, end_ms: i64) -> Vec<BucketSnapshot> {
        let buckets = self.buckets.read();
        let mut out: Vec<BucketSnapshot> = buckets
            .iter()
            .filter(|(k, _)| k.ticker == ticker && k.minute_ms >= start_ms && k.minute_ms < end_ms)
            .map(|(k, v)| {
                let b = v.lock();
                BucketSnapshot {
                    minute_ms: k.minute_ms,
                    call_premium: b.call_premium,
                    put_premium: b.put_premium,
                    call_count: b.call_count,
                    put_count: b.put_count,
                    last_updated_ms: b.last_updated_ms,
                }
            })
            .collect();
        out.sort_by_key(|s| s.minute_ms);
        out
    }

    /// Latest minute processed for a ticker, if any event was ever seen.
    pub fn watermark(&self, ticker: &str) -> Option<i64> {
        self.watermarks.read().get(ticker).copied()
    }

    /// Drop buckets (and their dedup keys) whose minute is older than
    /// `cutoff_ms`. Returns how many buckets were removed.
    pub fn sweep_retention(&self, cutoff_ms: i64) -> usize {
        let removed = {
            let mut buckets = self.buckets.write();
            let before = buckets.len();
            buckets.retain(|k, _| k.minute_ms >= cutoff_ms);
            before - buckets.len()
        };
        self.seen.lock().retain(|_, minute| *minute >= cutoff_ms);
        removed
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    #[cfg(test)]
    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }
}
