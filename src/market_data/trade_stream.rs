// =============================================================================
// Trade Stream — Binance single-symbol trade WebSocket reader
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::types::TradeEvent;

/// Lock-free counters describing the feed, readable from any task.
#[derive(Default)]
pub struct FeedStats {
    connected: AtomicBool,
    connect_attempts: AtomicU64,
    trades_received: AtomicU64,
    decode_errors: AtomicU64,
    dropped_events: AtomicU64,
    late_trades: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatsSnapshot {
    pub connected: bool,
    pub connect_attempts: u64,
    pub trades_received: u64,
    pub decode_errors: u64,
    pub dropped_events: u64,
    pub late_trades: u64,
}

impl FeedStats {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade(&self) {
        self.trades_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_trade(&self) {
        self.late_trades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            trades_received: self.trades_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            late_trades: self.late_trades.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the trade stream at `url` and forward decoded trades into
/// `trades`.
///
/// Runs until the stream disconnects, goes silent for `stale_after`, or the
/// receiving side is gone, then returns so that the supervisor can handle
/// reconnection. Malformed messages are logged and skipped.
pub async fn run_trade_stream(
    url: &str,
    trades: &mpsc::Sender<TradeEvent>,
    stats: &FeedStats,
    stale_after: Duration,
) -> Result<()> {
    info!(url = %url, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to trade WebSocket")?;

    stats.set_connected(true);
    info!(url = %url, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        let next = tokio::time::timeout(stale_after, read.next())
            .await
            .with_context(|| format!("no frames received for {}ms", stale_after.as_millis()))?;

        match next {
            Some(Ok(Message::Text(text))) => match parse_trade(&text) {
                Ok(trade) => {
                    stats.record_trade();
                    match trades.try_send(trade) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => stats.record_dropped(),
                        Err(TrySendError::Closed(_)) => {
                            info!("aggregator gone, closing trade stream");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    stats.record_decode_error();
                    warn!(error = %format!("{e:#}"), "failed to parse trade message");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "trade WebSocket closed by peer");
                return Ok(());
            }
            // Ping / Pong / Binary / Frame: tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance trade message.
///
/// Expected shape:
/// ```json
/// { "e": "trade", "E": 1700000000123, "s": "BTCUSDT", "p": "37000.00", "T": 1700000000120 }
/// ```
/// `T` (trade time) is preferred; `E` (event time) is the fallback.
pub fn parse_trade(text: &str) -> Result<TradeEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let price = parse_string_f64(&root["p"], "p")?;
    if !price.is_finite() || price <= 0.0 {
        anyhow::bail!("price out of range: {price}");
    }

    let exchange_ts_ms = root["T"]
        .as_i64()
        .or_else(|| root["E"].as_i64())
        .context("missing field T")?;

    Ok(TradeEvent {
        price,
        exchange_ts_ms,
    })
}

/// Binance sends numeric values as JSON strings.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;

    /// Serve one WebSocket client: send `frames`, then either close or hold
    /// the connection open silently for `hold`.
    async fn serve_frames(frames: Vec<&'static str>, hold: Option<Duration>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for f in frames {
                ws.send(Message::Text(f.to_string())).await.unwrap();
            }
            match hold {
                Some(d) => tokio::time::sleep(d).await,
                None => {
                    let _ = ws.close(None).await;
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped_and_stream_continues() {
        let url = serve_frames(vec!["garbage", r#"{"e":"trade","p":"10.5","T":100200}"#], None).await;
        let (tx, mut rx) = mpsc::channel(8);
        let stats = FeedStats::default();

        run_trade_stream(&url, &tx, &stats, Duration::from_secs(5))
            .await
            .expect("peer close is a clean end of stream");

        let snap = stats.snapshot();
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.trades_received, 1);
        assert!(snap.connected);
        assert_eq!(rx.try_recv().unwrap(), TradeEvent { price: 10.5, exchange_ts_ms: 100_200 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_stream_is_treated_as_dead() {
        let url = serve_frames(vec![], Some(Duration::from_secs(10))).await;
        let (tx, _rx) = mpsc::channel(8);
        let stats = FeedStats::default();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_trade_stream(&url, &tx, &stats, Duration::from_millis(200)),
        )
        .await
        .expect("stale detection should end the stream");

        let err = result.expect_err("silence must be an error so the supervisor reconnects");
        assert!(format!("{err:#}").contains("no frames received"));
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let url = serve_frames(
            vec![r#"{"p":"1","T":1000}"#, r#"{"p":"2","T":2000}"#, r#"{"p":"3","T":3000}"#],
            None,
        )
        .await;
        let (tx, mut rx) = mpsc::channel(1);
        let stats = FeedStats::default();

        run_trade_stream(&url, &tx, &stats, Duration::from_secs(5)).await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.trades_received, 3);
        assert_eq!(snap.dropped_events, 2);
        assert_eq!(rx.try_recv().unwrap().price, 1.0);
    }

    #[test]
    fn parse_trade_ok() {
        let json = r#"{
            "e": "trade", "E": 1700000000123, "s": "BTCUSDT", "t": 12345,
            "p": "37000.50", "q": "0.010", "T": 1700000000120, "m": true, "M": true
        }"#;
        let t = parse_trade(json).expect("should parse");
        assert!((t.price - 37000.5).abs() < f64::EPSILON);
        assert_eq!(t.exchange_ts_ms, 1_700_000_000_120);
        assert_eq!(t.unix_secs(), 1_700_000_000);
    }

    #[test]
    fn parse_trade_falls_back_to_event_time() {
        let t = parse_trade(r#"{"p": 12.5, "E": 5000}"#).unwrap();
        assert_eq!(t.exchange_ts_ms, 5000);
        assert!((t.price - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_trade_rejects_malformed() {
        assert!(parse_trade("not json").is_err());
        assert!(parse_trade(r#"{"result": null, "id": 1}"#).is_err());
        assert!(parse_trade(r#"{"p": "abc", "T": 1}"#).is_err());
        assert!(parse_trade(r#"{"p": "1.0"}"#).is_err());
        assert!(parse_trade(r#"{"p": "-3", "T": 1}"#).is_err());
        assert!(parse_trade(r#"{"p": true, "T": 1}"#).is_err());
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = FeedStats::default();
        stats.set_connected(true);
        stats.record_connect_attempt();
        stats.record_trade();
        stats.record_trade();
        stats.record_decode_error();
        stats.record_dropped();
        stats.record_late_trade();

        let snap = stats.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.connect_attempts, 1);
        assert_eq!(snap.trades_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.dropped_events, 1);
        assert_eq!(snap.late_trades, 1);
    }
}
