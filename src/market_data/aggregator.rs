// =============================================================================
// Candle Aggregator — folds trades into fixed-width OHLC buckets
// =============================================================================
//
// Exactly one task owns a `CandleAggregator`. It receives trades over an
// mpsc channel from the feed supervisor and hands finalized candles to the
// shared `CandleStore`. On shutdown the channel is drained and the
// in-progress candle is flushed as a partial tail.
//
// Trades whose bucket is older than the in-progress one are dropped and
// counted; they never reopen a finalized candle.
// =============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::market_data::candle_store::{AppendOutcome, CandleStore};
use crate::market_data::trade_stream::FeedStats;
use crate::types::{Candle, TradeEvent};

/// What a single trade did to the aggregator state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeOutcome {
    /// First trade of the first bucket.
    Started,
    /// Folded into the in-progress candle.
    Updated,
    /// Closed the previous bucket; carries the finalized candle.
    Finalized(Candle),
    /// Belonged to a bucket older than the in-progress one.
    Late,
}

pub struct CandleAggregator {
    width_secs: i64,
    current: Option<Candle>,
}

impl CandleAggregator {
    pub fn new(width_secs: i64) -> Self {
        Self {
            width_secs: width_secs.max(1),
            current: None,
        }
    }

    /// Continue a candle that was flushed before its bucket closed.
    pub fn resume(width_secs: i64, candle: Candle) -> Self {
        let mut agg = Self::new(width_secs);
        if candle.bucket_start.rem_euclid(agg.width_secs) == 0 {
            agg.current = Some(candle);
        }
        agg
    }

    /// Start of the bucket containing `ts` (seconds, aligned to epoch).
    pub fn bucket_start(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.width_secs)
    }

    pub fn on_trade(&mut self, trade: &TradeEvent) -> TradeOutcome {
        let start = self.bucket_start(trade.unix_secs());

        match &mut self.current {
            None => {
                self.current = Some(Candle::opening(start, trade.price));
                TradeOutcome::Started
            }
            Some(c) if c.bucket_start == start => {
                c.absorb(trade.price);
                TradeOutcome::Updated
            }
            Some(c) if start < c.bucket_start => TradeOutcome::Late,
            Some(c) => {
                let finished = *c;
                *c = Candle::opening(start, trade.price);
                TradeOutcome::Finalized(finished)
            }
        }
    }

    /// Take the in-progress candle, leaving the aggregator empty.
    pub fn flush(&mut self) -> Option<Candle> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Aggregation task
// ---------------------------------------------------------------------------

/// Consume trades until the channel closes or shutdown is signalled, then
/// drain what is already queued and flush the partial candle.
pub async fn run_aggregator(
    mut aggregator: CandleAggregator,
    mut trades: mpsc::Receiver<TradeEvent>,
    store: Arc<CandleStore>,
    stats: Arc<FeedStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(resumed = ?aggregator.current(), "candle aggregator running");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = trades.recv() => match msg {
                Some(trade) => apply(&mut aggregator, &trade, &store, &stats).await,
                None => break,
            },
        }
    }

    trades.close();
    let mut drained = 0usize;
    while let Ok(trade) = trades.try_recv() {
        apply(&mut aggregator, &trade, &store, &stats).await;
        drained += 1;
    }

    let partial = aggregator.flush();
    let flush_store = store.clone();
    let flushed = tokio::task::spawn_blocking(move || match partial {
        Some(candle) => {
            flush_store.append_partial(candle);
        }
        None => flush_store.persist_now(),
    })
    .await;
    match (flushed, partial) {
        (Err(e), _) => error!(error = %e, "final snapshot write panicked"),
        (Ok(()), Some(candle)) => {
            info!(candle = %candle, drained, "flushed in-progress candle on shutdown")
        }
        (Ok(()), None) => info!(drained, "aggregator stopped, snapshot written"),
    }
}

/// Snapshot writes are blocking file I/O, so appends run on the blocking
/// pool. Awaiting each one keeps appends in arrival order.
async fn append_blocking(store: &Arc<CandleStore>, candle: Candle) -> AppendOutcome {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.append(candle)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, candle = %candle, "candle append task panicked");
            AppendOutcome::Rejected
        }
    }
}

async fn apply(
    aggregator: &mut CandleAggregator,
    trade: &TradeEvent,
    store: &Arc<CandleStore>,
    stats: &FeedStats,
) {
    match aggregator.on_trade(trade) {
        TradeOutcome::Finalized(candle) => {
            if append_blocking(store, candle).await == AppendOutcome::Rejected {
                stats.record_late_trade();
            }
            debug!(candle = %candle, "candle finalized");
        }
        TradeOutcome::Late => {
            stats.record_late_trade();
            debug!(
                price = trade.price,
                ts_ms = trade.exchange_ts_ms,
                current = ?aggregator.current().map(|c| c.bucket_start),
                "dropping late trade"
            );
        }
        TradeOutcome::Started | TradeOutcome::Updated => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
