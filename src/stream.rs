//! Live feed ingestion.
//!
//! Maintains one WebSocket session against the upstream options feed:
//! authenticate, subscribe to a wildcard per watchlist ticker, then drive
//! every trade message through the shared pipeline. Any failure drops the
//! session back to Disconnected and the supervising loop reconnects with
//! capped exponential backoff plus jitter, re-running the full handshake.
//! No session state survives a disconnect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{RawTradeEvent, TradeSource};
use crate::pipeline::TradePipeline;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Streaming,
}

/// What the state machine wants done after a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    None,
    SendSubscribe,
    Abort,
}

/// Status-message transition. Pure so the handshake sequencing is testable
/// without a socket.
pub fn next_state(state: ConnState, status: &str) -> (ConnState, StatusAction) {
    match status {
        "connected" => (state, StatusAction::None),
        "auth_success" => (ConnState::Subscribed, StatusAction::SendSubscribe),
        "auth_failed" | "auth_timeout" => (ConnState::Disconnected, StatusAction::Abort),
        // Subscription confirmations and anything unrecognized leave the
        // session where it is.
        _ => (state, StatusAction::None),
    }
}

/// One wildcard trade subscription per watchlist ticker.
pub fn subscription_params(watchlist: &[String]) -> String {
    watchlist
        .iter()
        .map(|t| format!("T.O:{t}*"))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug)]
pub enum FeedEvent {
    Status(String),
    Trade(RawTradeEvent),
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "ev")]
    event_type: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "sym")]
    symbol: Option<String>,
    #[serde(default, rename = "p")]
    price: Option<f64>,
    #[serde(default, rename = "s")]
    size: Option<u64>,
    #[serde(default, rename = "t")]
    timestamp_ms: Option<i64>,
}

/// Decode one inbound text frame (the feed batches events into arrays).
/// Junk frames and unknown event types are dropped, never fatal.
pub fn decode_events(text: &str) -> Vec<FeedEvent> {
    let values: Vec<serde_json::Value> = match serde_json::from_str(text) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(single) => vec![single],
        Err(_) => return Vec::new(),
    };

    let mut events = Vec::new();
    for value in values {
        let wire: WireEvent = match serde_json::from_value(value) {
            Ok(w) => w,
            Err(e) => {
                debug!(error = %e, "unparseable feed event");
                continue;
            }
        };
        match wire.event_type.as_str() {
            "status" => {
                if let Some(status) = wire.status {
                    events.push(FeedEvent::Status(status));
                }
            }
            "T" => {
                let (Some(symbol), Some(price), Some(size), Some(ts)) =
                    (wire.symbol, wire.price, wire.size, wire.timestamp_ms)
                else {
                    debug!("trade event missing fields");
                    continue;
                };
                events.push(FeedEvent::Trade(RawTradeEvent {
                    contract_code: symbol,
                    price,
                    quantity: size,
                    exchange_ts_ms: ts,
                }));
            }
            _ => {}
        }
    }
    events
}

pub struct StreamIngestor {
    ws_url: String,
    api_key: String,
    watchlist: Vec<String>,
    pipeline: Arc<TradePipeline>,
}

impl StreamIngestor {
    pub fn new(
        ws_url: String,
        api_key: String,
        watchlist: Vec<String>,
        pipeline: Arc<TradePipeline>,
    ) -> Self {
        Self {
            ws_url,
            api_key,
            watchlist,
            pipeline,
        }
    }

    /// Supervised session loop. Runs until the task is dropped; every
    /// session failure backs off with jitter before the next full
    /// connect + auth + subscribe handshake.
    pub async fn run(self) {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("feed session closed cleanly; reconnecting");
                    reconnect_delay = INITIAL_RECONNECT_DELAY;
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = reconnect_delay.as_millis() as u64, "feed session failed; backing off");
                }
            }

            let jitter = Duration::from_millis(
                rand::thread_rng().gen_range(0..=reconnect_delay.as_millis() as u64 / 4 + 1),
            );
            sleep(reconnect_delay + jitter).await;
            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let mut state = ConnState::Connecting;
        info!(url = %self.ws_url, ?state, "connecting to feed");

        let (ws_stream, _resp) = connect_async(self.ws_url.as_str())
            .await
            .context("feed connect failed")?;
        let (mut write, mut read) = ws_stream.split();

        state = ConnState::Authenticating;
        let auth = serde_json::json!({ "action": "auth", "params": self.api_key });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .context("send auth")?;

        while let Some(frame) = read.next().await {
            let frame = frame.context("feed read failed")?;
            match frame {
                Message::Text(text) => {
                    for event in decode_events(&text) {
                        match event {
                            FeedEvent::Status(status) => {
                                let (next, action) = next_state(state, &status);
                                state = next;
                                match action {
                                    StatusAction::SendSubscribe => {
                                        let sub = serde_json::json!({
                                            "action": "subscribe",
                                            "params": subscription_params(&self.watchlist),
                                        });
                                        write
                                            .send(Message::Text(sub.to_string()))
                                            .await
                                            .context("send subscribe")?;
                                        state = ConnState::Streaming;
                                        info!(tickers = self.watchlist.len(), "authenticated and subscribed");
                                    }
                                    StatusAction::Abort => {
                                        anyhow::bail!("feed rejected session: {status}");
                                    }
                                    StatusAction::None => {
                                        debug!(status = %status, ?state, "feed status");
                                    }
                                }
                            }
                            FeedEvent::Trade(raw) => {
                                // One bad message degrades one trade, never
                                // the connection.
                                if let Err(e) =
                                    self.pipeline.process(&raw, TradeSource::Live).await
                                {
                                    warn!(contract = %raw.contract_code, error = %e, "pipeline error on live trade");
                                }
                            }
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(frame) => {
                    debug!(?frame, "feed close frame");
                    return Ok(());
                }
                _ => {}
            }
        }

        anyhow::bail!("feed stream ended")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_transitions() {
        // Connection confirmation does not advance past Authenticating.
        let (s, a) = next_state(ConnState::Authenticating, "connected");
        assert_eq!(s, ConnState::Authenticating);
        assert_eq!(a, StatusAction::None);

        // Auth success moves to Subscribed and asks for the subscribe send.
        let (s, a) = next_state(ConnState::Authenticating, "auth_success");
        assert_eq!(s, ConnState::Subscribed);
        assert_eq!(a, StatusAction::SendSubscribe);

        // Auth failure tears the session down.
        let (s, a) = next_state(ConnState::Authenticating, "auth_failed");
        assert_eq!(s, ConnState::Disconnected);
        assert_eq!(a, StatusAction::Abort);

        // Subscription confirmations are inert.
        let (s, a) = next_state(ConnState::Streaming, "success");
        assert_eq!(s, ConnState::Streaming);
        assert_eq!(a, StatusAction::None);
    }

    #[test]
    fn subscription_is_one_wildcard_per_ticker() {
        let params = subscription_params(&["TSLA".to_string(), "NVDA".to_string()]);
        assert_eq!(params, "T.O:TSLA*,T.O:NVDA*");
    }

    #[test]
    fn decodes_batched_trades_and_status() {
        let text = r#"[
            {"ev":"status","status":"auth_success","message":"authenticated"},
            {"ev":"T","sym":"O:TSLA260116C00300000","p":5.25,"s":40,"t":1767627000000},
            {"ev":"Q","sym":"ignored"}
        ]"#;
        let events = decode_events(text);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], FeedEvent::Status(s) if s == "auth_success"));
        match &events[1] {
            FeedEvent::Trade(raw) => {
                assert_eq!(raw.contract_code, "O:TSLA260116C00300000");
                assert_eq!(raw.price, 5.25);
                assert_eq!(raw.quantity, 40);
                assert_eq!(raw.exchange_ts_ms, 1_767_627_000_000);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn junk_frames_decode_to_nothing() {
        assert!(decode_events("PONG").is_empty());
        assert!(decode_events("{not json").is_empty());
        assert!(decode_events(r#"[{"ev":"T","sym":"O:X"}]"#).is_empty());
    }
}
