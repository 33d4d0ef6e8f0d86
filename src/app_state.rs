// =============================================================================
// Central Application State
// =============================================================================
//
// Everything the query server may read, shared across tasks via
// `Arc<AppState>`. The candle history is only mutated by the aggregator
// task through `CandleStore`; handlers get copies.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;

use crate::market_data::trade_stream::FeedStatsSnapshot;
use crate::market_data::{CandleStore, FeedStats};
use crate::runtime_config::ServiceConfig;
use crate::types::Candle;

pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<CandleStore>,
    pub feed_stats: Arc<FeedStats>,
    /// Instant when the service was started. Used for uptime.
    pub start_time: std::time::Instant,
}

/// Health payload returned by `/api/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub symbol: String,
    pub bucket_width_secs: i64,
    pub candles_held: usize,
    pub history_cap: usize,
    pub last_bucket_start: Option<i64>,
    pub persist_failures: u64,
    pub feed: FeedStatsSnapshot,
    pub uptime_secs: u64,
    pub server_time: i64,
}

impl AppState {
    pub fn new(config: Arc<ServiceConfig>, store: Arc<CandleStore>, feed_stats: Arc<FeedStats>) -> Self {
        Self {
            config,
            store,
            feed_stats,
            start_time: std::time::Instant::now(),
        }
    }

    /// The most recent `limit` candles, oldest first.
    pub fn recent_candles(&self, limit: usize) -> Vec<Candle> {
        self.store.recent(limit)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            symbol: self.config.symbol.clone(),
            bucket_width_secs: self.config.bucket_width_secs,
            candles_held: self.store.len(),
            history_cap: self.store.cap(),
            last_bucket_start: self.store.recent(1).first().map(|c| c.bucket_start),
            persist_failures: self.store.persist_failures(),
            feed: self.feed_stats.snapshot(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: chrono::Utc::now().timestamp_millis(),
        }
    }
}
