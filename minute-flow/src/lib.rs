/// Minute Flow
///
/// Streaming market data aggregation for a single exchange session:
/// - Binary feed decoding and a reconnecting feed supervisor
/// - Tick rule buy/sell volume aggregation into one-minute buckets
/// - One-minute OHLC candle capture from the feed's own candles
/// - Bounded load shedding queue and a dual-trigger batch writer
/// - Wall-clock aligned job scheduling and an operator command surface
/// - Offline reconstruction of buckets and candles from the raw tick archive
pub mod aggregate;
pub mod clock;
pub mod command;
pub mod error;
pub mod feed;
pub mod instrument;
pub mod jobs;
pub mod notify;
pub mod offline;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod token;

#[cfg(test)]
mod test_util;

// Re-export commonly used types for convenience
pub use aggregate::{AggregateDocument, ArchivedTick, Candle, MinuteVolumeBucket};
pub use clock::{LocalTime, TradingSession};
pub use command::{Command, CommandReply, Controller};
pub use error::{DecodeError, FeedError, JobError, QueueError, StorageError, TickError};
pub use instrument::{Instrument, InstrumentKey};
pub use scheduler::{JobRegistry, ScheduleSpec, ScheduledJob};
pub use supervisor::{FeedSupervisor, SupervisorConfig, SupervisorState, SupervisorStatus};
