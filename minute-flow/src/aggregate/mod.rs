/// Documents emitted by the aggregators and placed on the aggregate queue.
pub mod document;

/// Tick-driven one-minute buy/sell volume buckets.
pub mod volume;

/// Feed supplied one-minute OHLC candles, closed by their successor.
pub mod candle;

pub use candle::CandleTracker;
pub use document::{AggregateDocument, ArchivedTick, Candle, MinuteVolumeBucket};
pub use volume::{Direction, TickState, VolumeTracker};
