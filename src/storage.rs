//! SQLite persistence for enriched trades.
//!
//! The trade table is the source of truth; aggregation buckets are a
//! derived view that can always be rebuilt from it. Writes are idempotent
//! on the dedup key so live and backfill runs over overlapping windows
//! never double-insert.

use anyhow::{Context, Result};
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{EnrichedTrade, OptionType};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS enriched_trades (
    dedup_key TEXT PRIMARY KEY,
    contract_code TEXT NOT NULL,
    underlying TEXT NOT NULL,
    option_type TEXT NOT NULL,
    strike REAL NOT NULL,
    expiration TEXT NOT NULL,
    price REAL NOT NULL,
    quantity INTEGER NOT NULL,
    premium REAL NOT NULL,
    days_to_expiration INTEGER NOT NULL,
    reference_price REAL NOT NULL,
    out_of_the_money INTEGER NOT NULL,
    distance_pct REAL NOT NULL,
    same_day_expiry INTEGER NOT NULL,
    source TEXT NOT NULL,
    exchange_ts_ms INTEGER NOT NULL,
    observed_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_underlying_ts
    ON enriched_trades(underlying, exchange_ts_ms DESC);

CREATE INDEX IF NOT EXISTS idx_trades_source
    ON enriched_trades(source, exchange_ts_ms DESC);
"#;

const SELECT_COLUMNS: &str = "contract_code, underlying, option_type, strike, expiration, \
     price, quantity, premium, days_to_expiration, reference_price, out_of_the_money, \
     distance_pct, same_day_expiry, source, exchange_ts_ms, observed_at";

/// Trade store shared between the ingest paths and read-side consumers.
#[derive(Clone)]
pub struct TradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl TradeStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM enriched_trades", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %db_path, existing = count, "trade store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert one accepted trade. Returns false when the dedup key already
    /// exists (replay over an already-ingested window).
    pub fn insert(&self, trade: &EnrichedTrade) -> Result<bool> {
        let key = trade.dedup_key();
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO enriched_trades
             (dedup_key, contract_code, underlying, option_type, strike, expiration,
              price, quantity, premium, days_to_expiration, reference_price,
              out_of_the_money, distance_pct, same_day_expiry, source, exchange_ts_ms, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                key,
                trade.contract_code,
                trade.underlying,
                trade.option_type.as_str(),
                trade.strike,
                trade.expiration.to_string(),
                trade.price,
                trade.quantity as i64,
                trade.premium,
                trade.days_to_expiration,
                trade.reference_price,
                trade.out_of_the_money as i64,
                trade.distance_pct,
                trade.same_day_expiry as i64,
                trade.source,
                trade.exchange_ts_ms,
                trade.observed_at.to_rfc3339(),
            ],
        )?;
        Ok(changes > 0)
    }

    /// Trades for one underlying with exchange timestamp in
    /// `[start_ms, end_ms)`, ascending by time.
    pub fn trades_in_range(
        &self,
        ticker: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<EnrichedTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLUMNS} FROM enriched_trades
             WHERE underlying = ?1 AND exchange_ts_ms >= ?2 AND exchange_ts_ms < ?3
             ORDER BY exchange_ts_ms ASC"
        ))?;
        let rows = stmt.query_map(params![ticker, start_ms, end_ms], row_to_trade)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Trade count per hour bucket for one underlying over
    /// `[start_ms, end_ms)`. Hours with no trades yield no row.
    pub fn hourly_counts(
        &self,
        ticker: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(i64, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT (exchange_ts_ms / 3600000) * 3600000 AS hour_start, COUNT(*)
             FROM enriched_trades
             WHERE underlying = ?1 AND exchange_ts_ms >= ?2 AND exchange_ts_ms < ?3
             GROUP BY hour_start ORDER BY hour_start ASC",
        )?;
        let rows = stmt.query_map(params![ticker, start_ms, end_ms], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn trade_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM enriched_trades", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete trades observed before `cutoff_ms`. Returns rows removed.
    pub fn sweep_retention(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM enriched_trades WHERE exchange_ts_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(removed)
    }
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnrichedTrade> {
    let option_type_str: String = row.get(2)?;
    let option_type = OptionType::parse(&option_type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown option type {option_type_str}").into(),
        )
    })?;

    let expiration_str: String = row.get(4)?;
    let expiration = expiration_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad expiration {expiration_str}: {e}").into(),
        )
    })?;

    let observed_str: String = row.get(15)?;
    let observed_at = DateTime::parse_from_rfc3339(&observed_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                15,
                rusqlite::types::Type::Text,
                format!("bad observed_at {observed_str}: {e}").into(),
            )
        })?
        .to_utc();

    Ok(EnrichedTrade {
        contract_code: row.get(0)?,
        underlying: row.get(1)?,
        option_type,
        strike: row.get(3)?,
        expiration,
        price: row.get(5)?,
        quantity: row.get::<_, i64>(6)? as u64,
        premium: row.get(7)?,
        days_to_expiration: row.get(8)?,
        reference_price: row.get(9)?,
        out_of_the_money: row.get::<_, i64>(10)? != 0,
        distance_pct: row.get(11)?,
        same_day_expiry: row.get::<_, i64>(12)? != 0,
        source: row.get(13)?,
        exchange_ts_ms: row.get(14)?,
        observed_at,
    })
}
