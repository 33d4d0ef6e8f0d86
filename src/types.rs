// =============================================================================
// Shared types used across the candle recorder
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single decoded trade from the upstream feed. Never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeEvent {
    pub price: f64,
    /// Exchange trade time in milliseconds since the Unix epoch.
    pub exchange_ts_ms: i64,
}

impl TradeEvent {
    /// Trade time in whole seconds, floored.
    pub fn unix_secs(&self) -> i64 {
        self.exchange_ts_ms.div_euclid(1000)
    }
}

/// One OHLC candle covering `[bucket_start, bucket_start + width)`.
///
/// On the wire and on disk a candle is the 5-element tuple
/// `[bucket_start, open, high, low, close]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "CandleRow", into = "CandleRow")]
pub struct Candle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Serialize, Deserialize)]
struct CandleRow(i64, f64, f64, f64, f64);

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        Self {
            bucket_start: row.0,
            open: row.1,
            high: row.2,
            low: row.3,
            close: row.4,
        }
    }
}

impl From<Candle> for CandleRow {
    fn from(c: Candle) -> Self {
        CandleRow(c.bucket_start, c.open, c.high, c.low, c.close)
    }
}

impl Candle {
    /// Open a new candle from the first trade of a bucket.
    pub fn opening(bucket_start: i64, price: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// Fold another trade of the same bucket into this candle.
    pub fn absorb(&mut self, price: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
    }

    /// `low <= open, close <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }
}

impl std::fmt::Display for Candle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} o={} h={} l={} c={}]",
            self.bucket_start, self.open, self.high, self.low, self.close
        )
    }
}
