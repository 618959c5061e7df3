//! Vendor option contract code decoding.
//!
//! Codes look like `O:TSLA260116C00300000`: underlying ticker (variable
//! length), 6-digit YYMMDD expiration, one `C`/`P` type character, and an
//! 8-digit strike scaled by 1000. The same decoder runs on both the live
//! stream and historical replay so filtering decisions match exactly.

use chrono::NaiveDate;

use crate::models::{OptionType, ParsedContract};

/// Earliest position (after the `O:` prefix) where the type character can
/// sit: at least one underlying character plus the 6-digit date.
const MIN_TYPE_OFFSET: usize = 7;

const STRIKE_DIGITS: usize = 8;
const DATE_DIGITS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractParseError {
    MissingPrefix,
    TooShort,
    NoTypeMarker,
    BadUnderlying(String),
    BadDate(String),
    BadStrike(String),
}

impl std::fmt::Display for ContractParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractParseError::MissingPrefix => write!(f, "missing O: prefix"),
            ContractParseError::TooShort => write!(f, "code too short"),
            ContractParseError::NoTypeMarker => write!(f, "no C/P type marker found"),
            ContractParseError::BadUnderlying(u) => write!(f, "invalid underlying {u}"),
            ContractParseError::BadDate(d) => write!(f, "invalid expiration date {d}"),
            ContractParseError::BadStrike(s) => write!(f, "invalid strike {s}"),
        }
    }
}

impl std::error::Error for ContractParseError {}

/// Decode a vendor contract code into its parts.
///
/// The underlying ticker may itself contain `C` or `P` (COIN, PLTR, ...),
/// so the scan anchors on the first type character at or after
/// `MIN_TYPE_OFFSET` whose surrounding context fits: 6 digits immediately
/// before, 8 digits immediately after ending the code.
pub fn parse_contract_code(code: &str) -> Result<ParsedContract, ContractParseError> {
    let sym = code
        .strip_prefix("O:")
        .ok_or(ContractParseError::MissingPrefix)?;

    // 1 underlying char + 6 date + 1 type + 8 strike.
    if sym.len() < 1 + DATE_DIGITS + 1 + STRIKE_DIGITS {
        return Err(ContractParseError::TooShort);
    }
    if !sym.is_ascii() {
        return Err(ContractParseError::NoTypeMarker);
    }

    let bytes = sym.as_bytes();
    let mut anchor = None;
    for idx in MIN_TYPE_OFFSET..bytes.len() {
        let ch = bytes[idx];
        if ch != b'C' && ch != b'P' {
            continue;
        }
        let date_ok = bytes[idx - DATE_DIGITS..idx]
            .iter()
            .all(u8::is_ascii_digit);
        let strike_end = idx + 1 + STRIKE_DIGITS;
        let strike_ok = strike_end == bytes.len()
            && bytes[idx + 1..strike_end].iter().all(u8::is_ascii_digit);
        if date_ok && strike_ok {
            anchor = Some(idx);
            break;
        }
    }
    let type_idx = anchor.ok_or(ContractParseError::NoTypeMarker)?;

    let option_type = if bytes[type_idx] == b'C' {
        OptionType::Call
    } else {
        OptionType::Put
    };

    let underlying = sym[..type_idx - DATE_DIGITS].to_string();
    if underlying.is_empty() || !underlying.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ContractParseError::BadUnderlying(underlying));
    }

    let date_str = &sym[type_idx - DATE_DIGITS..type_idx];
    let yy: i32 = date_str[0..2].parse().map_err(|_| {
        ContractParseError::BadDate(date_str.to_string())
    })?;
    let mm: u32 = date_str[2..4].parse().map_err(|_| {
        ContractParseError::BadDate(date_str.to_string())
    })?;
    let dd: u32 = date_str[4..6].parse().map_err(|_| {
        ContractParseError::BadDate(date_str.to_string())
    })?;
    let expiration = NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
        .ok_or_else(|| ContractParseError::BadDate(date_str.to_string()))?;

    let strike_str = &sym[type_idx + 1..];
    let strike_thousandths: u64 = strike_str
        .parse()
        .map_err(|_| ContractParseError::BadStrike(strike_str.to_string()))?;
    let strike = strike_thousandths as f64 / 1000.0;

    Ok(ParsedContract {
        underlying,
        option_type,
        strike,
        expiration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_and_put() {
        let call = parse_contract_code("O:TSLA260116C00300000").unwrap();
        assert_eq!(call.underlying, "TSLA");
        assert_eq!(call.option_type, OptionType::Call);
        assert_eq!(call.strike, 300.0);
        assert_eq!(
            call.expiration,
            NaiveDate::from_ymd_opt(2026, 1, 16).unwrap()
        );

        let put = parse_contract_code("O:SPY241220P00720000").unwrap();
        assert_eq!(put.underlying, "SPY");
        assert_eq!(put.option_type, OptionType::Put);
        assert_eq!(put.strike, 720.0);
    }

    #[test]
    fn underlying_containing_type_letters() {
        // COIN starts with C, PLTR starts with P; the anchor scan must not
        // mistake those for the type marker.
        let coin = parse_contract_code("O:COIN260220C00450000").unwrap();
        assert_eq!(coin.underlying, "COIN");
        assert_eq!(coin.option_type, OptionType::Call);
        assert_eq!(coin.strike, 450.0);

        let pltr = parse_contract_code("O:PLTR251219P00080500").unwrap();
        assert_eq!(pltr.underlying, "PLTR");
        assert_eq!(pltr.option_type, OptionType::Put);
        assert_eq!(pltr.strike, 80.5);
    }

    #[test]
    fn fractional_strike() {
        let c = parse_contract_code("O:AMD260116C00162500").unwrap();
        assert_eq!(c.strike, 162.5);
    }

    #[test]
    fn deterministic() {
        let a = parse_contract_code("O:NVDA260220P00095000").unwrap();
        let b = parse_contract_code("O:NVDA260220P00095000").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            parse_contract_code("TSLA260116C00300000"),
            Err(ContractParseError::MissingPrefix)
        );
        assert_eq!(
            parse_contract_code("O:T260116C003"),
            Err(ContractParseError::TooShort)
        );
        assert_eq!(
            parse_contract_code("O:TSLA26011600300000X"),
            Err(ContractParseError::NoTypeMarker)
        );
        // Month 13 is structurally well-formed but not a calendar date.
        assert!(matches!(
            parse_contract_code("O:TSLA261301C00300000"),
            Err(ContractParseError::BadDate(_))
        ));
        // Punctuation in the underlying is named as such, not reported as a
        // missing type marker.
        assert_eq!(
            parse_contract_code("O:TS.A260116C00300000"),
            Err(ContractParseError::BadUnderlying("TS.A".to_string()))
        );
    }
}
