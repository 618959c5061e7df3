//! On-demand pattern detection over aggregated state and recent trades.
//!
//! Three independent heuristics, each side-effect-free: they read, flag,
//! and return, never mutating buckets or trades. The facade assembles
//! inputs from the store and the aggregation engine.

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::aggregation::AggregationEngine;
use crate::models::{EnrichedTrade, FlowPattern, OptionType, PatternKind};
use crate::storage::TradeStore;

const HOUR_MS: i64 = 3_600_000;
const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Trailing window for strike concentration, minutes.
    pub concentration_window_min: i64,
    /// Minimum hits on one (strike, expiry, type) to flag.
    pub min_strike_hits: usize,
    /// Historical lookback for the hourly volume baseline, hours.
    pub volume_lookback_hours: i64,
    /// Recent-hour count must exceed baseline by this multiple.
    pub volume_ratio: f64,
    /// Absolute recent-hour count noise floor.
    pub volume_floor: u64,
    /// Minimum dollar change for a sentiment flip.
    pub flip_min_magnitude: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            concentration_window_min: 30,
            min_strike_hits: 2,
            volume_lookback_hours: 24,
            volume_ratio: 2.0,
            volume_floor: 5,
            flip_min_magnitude: 250_000.0,
        }
    }
}

/// Flag any (strike, expiration, type) group hit at least `min_hits` times
/// in the supplied trailing-window trades.
pub fn detect_strike_concentration(
    ticker: &str,
    trades: &[EnrichedTrade],
    min_hits: usize,
) -> Vec<FlowPattern> {
    // Strike keyed in thousandths so float strikes group exactly.
    let mut groups: HashMap<(i64, chrono::NaiveDate, OptionType), Vec<&EnrichedTrade>> =
        HashMap::new();
    for trade in trades {
        let key = (
            (trade.strike * 1000.0).round() as i64,
            trade.expiration,
            trade.option_type,
        );
        groups.entry(key).or_default().push(trade);
    }

    let mut patterns = Vec::new();
    for ((strike_k, expiration, option_type), hits) in groups {
        if hits.len() < min_hits {
            continue;
        }
        let strike = strike_k as f64 / 1000.0;
        let total_premium: f64 = hits.iter().map(|t| t.premium).sum();

        let description = format!(
            "{} hits on {} {} {} {} (${:.0} total premium)",
            hits.len(),
            ticker,
            strike,
            option_type.as_str(),
            expiration,
            total_premium,
        );
        info!(ticker = %ticker, strike, side = option_type.as_str(), hits = hits.len(), "strike concentration flagged");

        patterns.push(FlowPattern::new(
            PatternKind::StrikeConcentration,
            ticker.to_string(),
            description,
            json!({
                "strike": strike,
                "expiration": expiration.to_string(),
                "side": option_type.as_str(),
                "hit_count": hits.len(),
                "total_premium": total_premium,
            }),
        ));
    }
    patterns
}

/// Flag when the recent-hour trade count strictly exceeds the configured
/// multiple of the historical hourly average and clears an absolute noise
/// floor. Exactly hitting the multiple does not flag. Hours with zero
/// trades in the lookback count toward the average.
pub fn detect_unusual_volume(
    ticker: &str,
    recent_count: u64,
    historical_counts: &[(i64, u64)],
    lookback_hours: i64,
    ratio: f64,
    floor: u64,
) -> Option<FlowPattern> {
    if lookback_hours <= 0 || historical_counts.is_empty() {
        return None;
    }
    let total: u64 = historical_counts.iter().map(|(_, c)| c).sum();
    let avg = total as f64 / lookback_hours as f64;
    if avg <= 0.0 {
        return None;
    }

    let observed_ratio = recent_count as f64 / avg;
    if observed_ratio <= ratio || recent_count < floor {
        return None;
    }

    let description = format!(
        "{} trades on {} in the last hour vs {:.1}/hr average ({:.1}x)",
        recent_count, ticker, avg, observed_ratio,
    );
    info!(ticker = %ticker, recent = recent_count, avg, "unusual volume flagged");

    Some(FlowPattern::new(
        PatternKind::UnusualVolume,
        ticker.to_string(),
        description,
        json!({
            "recent_count": recent_count,
            "hourly_average": avg,
            "ratio": observed_ratio,
        }),
    ))
}

/// Flag when net premium (calls minus puts) inverts sign between the prior
/// and recent hour windows and the swing clears the dollar threshold.
pub fn detect_sentiment_flip(
    ticker: &str,
    recent_net: f64,
    prior_net: f64,
    min_magnitude: f64,
) -> Option<FlowPattern> {
    if recent_net * prior_net >= 0.0 {
        return None;
    }
    let magnitude = (recent_net - prior_net).abs();
    if magnitude < min_magnitude {
        return None;
    }

    let direction = if recent_net > 0.0 {
        "bearish to bullish"
    } else {
        "bullish to bearish"
    };
    let description = format!(
        "{} net flow flipped {} (${:.0} -> ${:.0}, ${:.0} swing)",
        ticker, direction, prior_net, recent_net, magnitude,
    );
    info!(ticker = %ticker, prior_net, recent_net, "sentiment flip flagged");

    Some(FlowPattern::new(
        PatternKind::SentimentFlip,
        ticker.to_string(),
        description,
        json!({
            "prior_net_premium": prior_net,
            "recent_net_premium": recent_net,
            "swing": magnitude,
        }),
    ))
}

/// Facade that runs all three heuristics for one ticker as of `now_ms`.
pub struct PatternDetector {
    store: TradeStore,
    engine: Arc<AggregationEngine>,
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(store: TradeStore, engine: Arc<AggregationEngine>, config: PatternConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    pub fn scan(&self, ticker: &str, now_ms: i64) -> Result<Vec<FlowPattern>> {
        let mut patterns = Vec::new();

        let window_start = now_ms - self.config.concentration_window_min * MINUTE_MS;
        let recent_trades = self.store.trades_in_range(ticker, window_start, now_ms)?;
        patterns.extend(detect_strike_concentration(
            ticker,
            &recent_trades,
            self.config.min_strike_hits,
        ));

        let recent_hour_start = now_ms - HOUR_MS;
        let lookback_start = recent_hour_start - self.config.volume_lookback_hours * HOUR_MS;
        let recent_count = self
            .store
            .trades_in_range(ticker, recent_hour_start, now_ms)?
            .len() as u64;
        let historical = self
            .store
            .hourly_counts(ticker, lookback_start, recent_hour_start)?;
        patterns.extend(detect_unusual_volume(
            ticker,
            recent_count,
            &historical,
            self.config.volume_lookback_hours,
            self.config.volume_ratio,
            self.config.volume_floor,
        ));

        let recent_net: f64 = self
            .engine
            .read_range(ticker, recent_hour_start, now_ms)
            .iter()
            .map(|b| b.net_premium())
            .sum();
        let prior_net: f64 = self
            .engine
            .read_range(ticker, recent_hour_start - HOUR_MS, recent_hour_start)
            .iter()
            .map(|b| b.net_premium())
            .sum();
        patterns.extend(detect_sentiment_flip(
            ticker,
            recent_net,
            prior_net,
            self.config.flip_min_magnitude,
        ));

        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn trade(strike: f64, option_type: OptionType, premium: f64, ts_ms: i64) -> EnrichedTrade {
        EnrichedTrade {
            contract_code: format!("O:X260116C{:08}", (strike * 1000.0) as u64),
            underlying: "X".to_string(),
            option_type,
            strike,
            expiration: NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
            price: 1.0,
            quantity: 1,
            premium,
            days_to_expiration: 10,
            reference_price: strike - 5.0,
            out_of_the_money: true,
            distance_pct: 5.0,
            same_day_expiry: false,
            source: "live".to_string(),
            exchange_ts_ms: ts_ms,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn strike_concentration_flags_repeated_hits() {
        // Five hits on the same strike/expiry/type within the window.
        let trades: Vec<_> = (0..5)
            .map(|i| trade(100.0, OptionType::Call, 30_000.0, i * MINUTE_MS))
            .collect();

        let flagged = detect_strike_concentration("X", &trades, 2);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].kind, PatternKind::StrikeConcentration);
        assert_eq!(flagged[0].figures["hit_count"], 5);
        assert_eq!(flagged[0].figures["total_premium"], 150_000.0);
        assert_eq!(flagged[0].figures["side"], "call");
    }

    #[test]
    fn strike_concentration_separates_sides_and_ignores_singles() {
        let trades = vec![
            trade(100.0, OptionType::Call, 30_000.0, 0),
            trade(100.0, OptionType::Put, 30_000.0, 0),
            trade(105.0, OptionType::Call, 30_000.0, 0),
        ];
        // One call + one put at 100 are different groups; nothing reaches 2.
        assert!(detect_strike_concentration("X", &trades, 2).is_empty());
    }

    #[test]
    fn unusual_volume_requires_ratio_and_floor() {
        let history: Vec<(i64, u64)> = (0..24).map(|h| (h * HOUR_MS, 4)).collect();

        // 4/hr average, 12 recent: 3x and above floor 5.
        let flagged = detect_unusual_volume("X", 12, &history, 24, 2.0, 5).unwrap();
        assert_eq!(flagged.kind, PatternKind::UnusualVolume);
        assert_eq!(flagged.figures["recent_count"], 12);

        // Ratio met but below the noise floor.
        assert!(detect_unusual_volume("X", 4, &[(0, 1)], 24, 2.0, 5).is_none());
        // Floor met but ratio not.
        assert!(detect_unusual_volume("X", 6, &history, 24, 2.0, 5).is_none());
        // Exactly the configured multiple (8 vs 4/hr at 2.0x) is not
        // "exceeds"; one more trade is.
        assert!(detect_unusual_volume("X", 8, &history, 24, 2.0, 5).is_none());
        assert!(detect_unusual_volume("X", 9, &history, 24, 2.0, 5).is_some());
        // No history at all: nothing to compare against.
        assert!(detect_unusual_volume("X", 50, &[], 24, 2.0, 5).is_none());
    }

    #[test]
    fn sentiment_flip_flags_sign_inversion() {
        // -600k prior, +900k recent: 1.5M swing.
        let flagged = detect_sentiment_flip("X", 900_000.0, -600_000.0, 500_000.0).unwrap();
        assert_eq!(flagged.kind, PatternKind::SentimentFlip);
        assert_eq!(flagged.figures["swing"], 1_500_000.0);
        assert!(flagged.description.contains("bearish to bullish"));
    }

    #[test]
    fn sentiment_flip_needs_inversion_and_magnitude() {
        // Same sign: no flag regardless of magnitude.
        assert!(detect_sentiment_flip("X", 900_000.0, 100_000.0, 1_000.0).is_none());
        // Inverted but below threshold.
        assert!(detect_sentiment_flip("X", 100.0, -100.0, 500_000.0).is_none());
        // Zero prior is not an inversion.
        assert!(detect_sentiment_flip("X", 900_000.0, 0.0, 1_000.0).is_none());
    }
}
