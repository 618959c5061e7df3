use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Standard US equity option contract multiplier.
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(OptionType::Call),
            "put" => Some(OptionType::Put),
            _ => None,
        }
    }
}

/// A trade event as it arrives off the wire, before any decoding of the
/// contract code. Exists only during pipeline transit.
#[derive(Debug, Clone)]
pub struct RawTradeEvent {
    /// Vendor contract code, e.g. `O:TSLA260116C00300000`.
    pub contract_code: String,
    /// Per-contract execution price.
    pub price: f64,
    /// Number of contracts.
    pub quantity: u64,
    /// Exchange timestamp, milliseconds since epoch.
    pub exchange_ts_ms: i64,
}

impl RawTradeEvent {
    /// Deduplication key shared by the live and replay paths. Two events
    /// with the same contract, exchange timestamp, and size are treated as
    /// the same print.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.contract_code, self.exchange_ts_ms, self.quantity
        )
    }
}

/// Decoded contract identity. Derived deterministically from the contract
/// code by `contract::parse_contract_code`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContract {
    pub underlying: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
}

/// Where an enriched trade came from, so replayed records stay traceable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSource {
    Live,
    Backfill(NaiveDate),
}

impl TradeSource {
    pub fn as_tag(&self) -> String {
        match self {
            TradeSource::Live => "live".to_string(),
            TradeSource::Backfill(date) => format!("backfill:{}", date),
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag == "live" {
            return Some(TradeSource::Live);
        }
        let date = tag.strip_prefix("backfill:")?;
        date.parse().ok().map(TradeSource::Backfill)
    }
}

/// A trade that passed all four acceptance filters. Immutable once created;
/// every persisted record satisfies the filters it was accepted under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedTrade {
    pub contract_code: String,
    pub underlying: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub price: f64,
    pub quantity: u64,
    /// price * quantity * contract multiplier.
    pub premium: f64,
    /// Calendar days from observation date to expiration.
    pub days_to_expiration: i64,
    /// Underlying price used for the OTM decision.
    pub reference_price: f64,
    pub out_of_the_money: bool,
    /// Signed percent distance to strike; positive means further OTM.
    pub distance_pct: f64,
    pub same_day_expiry: bool,
    /// "live" or "backfill:YYYY-MM-DD".
    pub source: String,
    pub exchange_ts_ms: i64,
    pub observed_at: DateTime<Utc>,
}

impl EnrichedTrade {
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.contract_code, self.exchange_ts_ms, self.quantity
        )
    }
}

/// Pattern kinds surfaced by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    StrikeConcentration,
    UnusualVolume,
    SentimentFlip,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::StrikeConcentration => "strike_concentration",
            PatternKind::UnusualVolume => "unusual_volume",
            PatternKind::SentimentFlip => "sentiment_flip",
        }
    }
}

/// A flagged pattern with machine-readable supporting figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPattern {
    pub kind: PatternKind,
    pub ticker: String,
    pub description: String,
    pub figures: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

impl FlowPattern {
    pub fn new(
        kind: PatternKind,
        ticker: String,
        description: String,
        figures: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            ticker,
            description,
            figures,
            detected_at: Utc::now(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub api_key: String,
    pub ws_url: String,
    pub rest_base_url: String,
    pub watchlist: Vec<String>,
    /// Minimum institutional premium in dollars.
    pub min_premium: f64,
    /// Live price cache TTL in milliseconds.
    pub price_cache_ttl_ms: i64,
    /// Max pages fetched per contract during backfill.
    pub backfill_page_cap: u32,
    /// Fixed delay between backfill REST calls, milliseconds.
    pub backfill_call_delay_ms: u64,
    /// Bucket retention horizon in hours.
    pub retention_hours: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./whalewatch.db".to_string());

        let api_key = std::env::var("FEED_API_KEY").unwrap_or_default();

        let ws_url = std::env::var("FEED_WS_URL")
            .unwrap_or_else(|_| "wss://socket.polygon.io/options".to_string());

        let rest_base_url =
            std::env::var("FEED_REST_URL").unwrap_or_else(|_| "https://api.polygon.io".to_string());

        let watchlist = std::env::var("WATCHLIST")
            .unwrap_or_else(|_| "TSLA,NVDA,AAPL,AMD,MSFT,AMZN,META,SPY,QQQ".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let min_premium = std::env::var("MIN_PREMIUM_USD")
            .unwrap_or_else(|_| "25000".to_string())
            .parse()
            .unwrap_or(25_000.0);

        let price_cache_ttl_ms = std::env::var("PRICE_CACHE_TTL_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let backfill_page_cap = std::env::var("BACKFILL_PAGE_CAP")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let backfill_call_delay_ms = std::env::var("BACKFILL_CALL_DELAY_MS")
            .unwrap_or_else(|_| "250".to_string())
            .parse()
            .unwrap_or(250);

        let retention_hours = std::env::var("BUCKET_RETENTION_HOURS")
            .unwrap_or_else(|_| "72".to_string())
            .parse()
            .unwrap_or(72);

        Ok(Self {
            database_path,
            api_key,
            ws_url,
            rest_base_url,
            watchlist,
            min_premium,
            price_cache_ttl_ms,
            backfill_page_cap,
            backfill_call_delay_ms,
            retention_hours,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tag_round_trip() {
        assert_eq!(TradeSource::from_tag("live"), Some(TradeSource::Live));
        let date = NaiveDate::from_ymd_opt(2026, 1, 16).unwrap();
        let tag = TradeSource::Backfill(date).as_tag();
        assert_eq!(tag, "backfill:2026-01-16");
        assert_eq!(
            TradeSource::from_tag(&tag),
            Some(TradeSource::Backfill(date))
        );
        assert_eq!(TradeSource::from_tag("backfill:garbage"), None);
    }

    #[test]
    fn dedup_key_is_stable() {
        let raw = RawTradeEvent {
            contract_code: "O:TSLA260116C00300000".to_string(),
            price: 1.25,
            quantity: 40,
            exchange_ts_ms: 1_700_000_000_000,
        };
        assert_eq!(raw.dedup_key(), "O:TSLA260116C00300000|1700000000000|40");
    }
}
