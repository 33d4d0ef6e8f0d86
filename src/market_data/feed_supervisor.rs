// =============================================================================
// Feed Supervisor — keeps the trade stream alive forever
// =============================================================================
//
// Every close or transport error is followed by a fixed reconnect delay.
// Reconnects are never abandoned; when they storm (more than the burst
// limit inside the window) a cool-down is added so a permanently broken
// endpoint cannot spin the loop.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::market_data::trade_stream::{run_trade_stream, FeedStats};
use crate::runtime_config::ServiceConfig;
use crate::types::TradeEvent;

/// Sliding-window reconnect counter.
pub struct ReconnectThrottle {
    attempts: VecDeque<Instant>,
    burst_limit: usize,
    window: Duration,
    cooldown: Duration,
}

impl ReconnectThrottle {
    pub fn new(burst_limit: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            attempts: VecDeque::new(),
            burst_limit: burst_limit.max(1),
            window,
            cooldown,
        }
    }

    /// Record a reconnect at `now` and return how long to wait before it.
    pub fn next_delay(&mut self, now: Instant, base: Duration) -> Duration {
        while let Some(&oldest) = self.attempts.front() {
            if now.duration_since(oldest) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        self.attempts.push_back(now);

        if self.attempts.len() > self.burst_limit {
            self.attempts.clear();
            base + self.cooldown
        } else {
            base
        }
    }
}

/// Reconnect loop around [`run_trade_stream`]. Returns only on shutdown or
/// when the aggregator has gone away.
pub async fn run_feed_supervisor(
    config: Arc<ServiceConfig>,
    trades: mpsc::Sender<TradeEvent>,
    stats: Arc<FeedStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = config.stream_url();
    let base_delay = config.reconnect_delay();
    let mut throttle = ReconnectThrottle::new(
        config.reconnect_burst_limit,
        Duration::from_secs(config.reconnect_window_secs),
        Duration::from_secs(config.reconnect_cooldown_secs),
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        stats.record_connect_attempt();

        let result = tokio::select! {
            r = run_trade_stream(&url, &trades, &stats, config.stale_after()) => r,
            _ = shutdown.changed() => {
                stats.set_connected(false);
                break;
            }
        };
        stats.set_connected(false);

        if trades.is_closed() {
            info!("trade receiver closed, feed supervisor stopping");
            break;
        }

        let delay = throttle.next_delay(Instant::now(), base_delay);
        match result {
            Ok(()) => warn!(delay_ms = delay.as_millis() as u64, "trade stream closed, reconnecting"),
            Err(e) => error!(
                error = %format!("{e:#}"),
                delay_ms = delay.as_millis() as u64,
                "trade stream error, reconnecting"
            ),
        }
        if delay > base_delay {
            warn!(
                cooldown_secs = (delay - base_delay).as_secs(),
                "reconnect storm detected, cooling down"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("feed supervisor stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
