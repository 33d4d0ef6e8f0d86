pub mod aggregator;
pub mod candle_store;
pub mod feed_supervisor;
pub mod trade_stream;

pub use aggregator::CandleAggregator;
pub use candle_store::CandleStore;
pub use trade_stream::FeedStats;
