//! Options flow ingestion and aggregation backend.
//!
//! Watches a fixed list of underlyings, filters the derivative trade feed
//! down to institutionally significant prints, and keeps per-minute premium
//! aggregates that downstream consumers read instead of scanning raw trade
//! history. Live streaming and historical backfill share one pipeline so
//! both paths make identical filtering decisions.

pub mod aggregation;
pub mod backfill;
pub mod contract;
pub mod models;
pub mod oracle;
pub mod patterns;
pub mod pipeline;
pub mod storage;
pub mod stream;
pub mod validator;
