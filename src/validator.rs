//! Acceptance filtering for parsed trades.
//!
//! Pure decision logic: the same `evaluate` call runs on the live stream
//! and on historical replay, so a trade is accepted or rejected identically
//! on both paths. Rejection is the expected majority outcome and is logged
//! at debug, never surfaced as an error.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{
    EnrichedTrade, OptionType, ParsedContract, TradeSource, CONTRACT_MULTIPLIER,
};

/// Maximum calendar days to expiration for an accepted trade.
pub const MAX_DTE: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NotInWatchlist(String),
    PremiumTooSmall(f64),
    Expired(i64),
    TooFarOut(i64),
    PriceUnavailable,
    InTheMoney,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotInWatchlist(t) => write!(f, "{t} not in watchlist"),
            RejectReason::PremiumTooSmall(p) => write!(f, "premium ${p:.0} below threshold"),
            RejectReason::Expired(d) => write!(f, "expired {} days ago", -d),
            RejectReason::TooFarOut(d) => write!(f, "{d} days to expiration exceeds {MAX_DTE}"),
            RejectReason::PriceUnavailable => write!(f, "reference price unavailable"),
            RejectReason::InTheMoney => write!(f, "contract is in the money"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Accept(Box<EnrichedTrade>),
    Reject(RejectReason),
}

#[derive(Debug, Clone)]
pub struct TradeValidator {
    watchlist: Vec<String>,
    min_premium: f64,
}

impl TradeValidator {
    pub fn new(watchlist: Vec<String>, min_premium: f64) -> Self {
        Self {
            watchlist,
            min_premium,
        }
    }

    /// Apply the four acceptance filters to one parsed trade.
    ///
    /// `reference_price` is `None` when the oracle could not produce a
    /// price; that rejects the trade rather than falling back to a stale
    /// or default value.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        contract: &ParsedContract,
        contract_code: &str,
        price: f64,
        quantity: u64,
        exchange_ts_ms: i64,
        observed_at: DateTime<Utc>,
        reference_price: Option<f64>,
        source: TradeSource,
    ) -> Verdict {
        if !self.watchlist.iter().any(|t| t == &contract.underlying) {
            return self.reject(
                contract_code,
                RejectReason::NotInWatchlist(contract.underlying.clone()),
            );
        }

        let premium = price * quantity as f64 * CONTRACT_MULTIPLIER;
        if premium < self.min_premium {
            return self.reject(contract_code, RejectReason::PremiumTooSmall(premium));
        }

        let dte = (contract.expiration - observed_at.date_naive()).num_days();
        if dte < 0 {
            return self.reject(contract_code, RejectReason::Expired(dte));
        }
        if dte > MAX_DTE {
            return self.reject(contract_code, RejectReason::TooFarOut(dte));
        }

        let Some(reference) = reference_price else {
            return self.reject(contract_code, RejectReason::PriceUnavailable);
        };

        let otm = match contract.option_type {
            OptionType::Call => contract.strike > reference,
            OptionType::Put => contract.strike < reference,
        };
        if !otm {
            return self.reject(contract_code, RejectReason::InTheMoney);
        }

        // Signed so a positive distance always means further out of the
        // money, for both sides.
        let raw_distance = (contract.strike - reference) / reference * 100.0;
        let distance_pct = match contract.option_type {
            OptionType::Call => raw_distance,
            OptionType::Put => -raw_distance,
        };

        Verdict::Accept(Box::new(EnrichedTrade {
            contract_code: contract_code.to_string(),
            underlying: contract.underlying.clone(),
            option_type: contract.option_type,
            strike: contract.strike,
            expiration: contract.expiration,
            price,
            quantity,
            premium,
            days_to_expiration: dte,
            reference_price: reference,
            out_of_the_money: true,
            distance_pct,
            same_day_expiry: dte == 0,
            source: source.as_tag(),
            exchange_ts_ms,
            observed_at,
        }))
    }

    fn reject(&self, contract_code: &str, reason: RejectReason) -> Verdict {
        debug!(contract = %contract_code, reason = %reason, "trade rejected");
        Verdict::Reject(reason)
    }
}
