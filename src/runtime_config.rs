// =============================================================================
// Service Configuration — JSON file + environment overrides
// =============================================================================
//
// Every tunable lives here. The JSON file is optional: all fields carry a
// serde default, so an older or partial file still loads. Environment
// variables (and `.env`) override the file, then `validated()` clamps values
// that would make the pipeline meaningless (zero-width buckets, empty
// history).
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3932".to_string()
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/candles_5s.json")
}

fn default_bucket_width_secs() -> i64 {
    5
}

fn default_history_cap() -> usize {
    1000
}

/// Upper bound for `history_cap`; every append rewrites the whole history.
pub const MAX_HISTORY_CAP: usize = 1_000_000;

/// Upper bound for counts that size queues or windows.
const MAX_QUEUE_LIMIT: usize = 1 << 20;

fn default_limit() -> usize {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_reconnect_burst_limit() -> usize {
    10
}

fn default_reconnect_window_secs() -> u64 {
    60
}

fn default_reconnect_cooldown_secs() -> u64 {
    30
}

fn default_stale_stream_secs() -> u64 {
    60
}

fn default_trade_channel_capacity() -> usize {
    4096
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

// =============================================================================
// ServiceConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    // --- Feed ----------------------------------------------------------------

    /// The single symbol whose trades are recorded.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Base of the single-stream WebSocket URL; `/<symbol>@trade` is appended.
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    /// Fixed delay before every reconnect attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Reconnects allowed inside `reconnect_window_secs` before the
    /// supervisor inserts a cool-down.
    #[serde(default = "default_reconnect_burst_limit")]
    pub reconnect_burst_limit: usize,

    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,

    #[serde(default = "default_reconnect_cooldown_secs")]
    pub reconnect_cooldown_secs: u64,

    /// A connection with no inbound frame for this long is considered dead.
    #[serde(default = "default_stale_stream_secs")]
    pub stale_stream_secs: u64,

    /// Buffer between the feed task and the aggregator. Trades beyond it
    /// are dropped.
    #[serde(default = "default_trade_channel_capacity")]
    pub trade_channel_capacity: usize,

    // --- Candles & storage ---------------------------------------------------

    #[serde(default = "default_bucket_width_secs")]
    pub bucket_width_secs: i64,

    /// Maximum number of finalized candles retained.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    // --- Query server --------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Candles returned when `limit` is absent or unparseable.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    // --- Lifecycle -----------------------------------------------------------

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            stream_base_url: default_stream_base_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_burst_limit: default_reconnect_burst_limit(),
            reconnect_window_secs: default_reconnect_window_secs(),
            reconnect_cooldown_secs: default_reconnect_cooldown_secs(),
            stale_stream_secs: default_stale_stream_secs(),
            trade_channel_capacity: default_trade_channel_capacity(),
            bucket_width_secs: default_bucket_width_secs(),
            history_cap: default_history_cap(),
            snapshot_path: default_snapshot_path(),
            bind_addr: default_bind_addr(),
            default_limit: default_limit(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing or malformed file is an error; the caller decides whether
    /// to fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), symbol = %config.symbol, "config loaded");
        Ok(config)
    }

    /// Apply `CANDLE_*` environment overrides on top of the loaded values.
    pub fn apply_env(mut self) -> Self {
        if let Some(sym) = env_string("CANDLE_SYMBOL") {
            self.symbol = sym.to_uppercase();
        }
        if let Some(url) = env_string("CANDLE_STREAM_BASE_URL") {
            self.stream_base_url = url;
        }
        if let Some(addr) = env_string("CANDLE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(path) = env_string("CANDLE_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse::<i64>("CANDLE_BUCKET_SECS") {
            self.bucket_width_secs = secs;
        }
        if let Some(cap) = env_parse::<usize>("CANDLE_HISTORY_CAP") {
            self.history_cap = cap;
        }
        if let Some(ms) = env_parse::<u64>("CANDLE_RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = ms;
        }
        self
    }

    /// Clamp values that would break the pipeline.
    pub fn validated(mut self) -> Self {
        if self.bucket_width_secs < 1 {
            warn!(value = self.bucket_width_secs, "bucket_width_secs < 1, clamping to 1");
            self.bucket_width_secs = 1;
        }
        if self.history_cap == 0 {
            warn!("history_cap is 0, clamping to 1");
            self.history_cap = 1;
        }
        if self.history_cap > MAX_HISTORY_CAP {
            warn!(value = self.history_cap, max = MAX_HISTORY_CAP, "history_cap too large, clamping");
            self.history_cap = MAX_HISTORY_CAP;
        }
        self.default_limit = self.default_limit.max(1);
        self.reconnect_burst_limit = self.reconnect_burst_limit.clamp(1, MAX_QUEUE_LIMIT);
        self.trade_channel_capacity = self.trade_channel_capacity.clamp(1, MAX_QUEUE_LIMIT);
        self.stale_stream_secs = self.stale_stream_secs.max(1);
        self.symbol = self.symbol.trim().to_uppercase();
        if self.symbol.is_empty() {
            self.symbol = default_symbol();
        }
        self
    }

    /// Full trade-stream URL for the configured symbol.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}@trade",
            self.stream_base_url.trim_end_matches('/'),
            self.symbol.to_lowercase()
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_stream_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
