/// Bounded, load shedding aggregate queue.
pub mod queue;

/// Single consumer batch writer with size and time flush triggers.
pub mod writer;

pub use queue::{AggregateQueue, QueueConfig, QueueReceiver, QueueSender};
pub use writer::{BatchWriter, WriterConfig, WriterControl, WriterHandle, WriterStats};
