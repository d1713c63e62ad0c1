use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated while connecting to, subscribing to, or reading from the market
/// data feed.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum FeedError {
    #[error("failed to initialise feed session due to empty instrument list")]
    InstrumentsEmpty,

    #[error("instrument directory unavailable: {0}")]
    Directory(String),

    #[error("auth token unavailable for owner {owner}: {reason}")]
    Token { owner: SmolStr, reason: String },

    #[error("subscription rejected: {0}")]
    Subscription(String),

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("no feed data received for {secs} seconds")]
    ReadTimeout { secs: u64 },

    #[error("feed stream ended")]
    StreamEnded,
}

impl FeedError {
    /// Determine if an error indicates the transport connection is gone and must be
    /// re-established.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::StreamEnded | FeedError::ReadTimeout { .. } => true,
            FeedError::Socket(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("terminated")
                    || error_lower.contains("connectionclosed")
                    || error_lower.contains("alreadyclosed")
                    || error_lower.contains("sendafterclosing")
                    || error_lower.contains("io(")
                    || error_lower.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(format!("{value:?}"))
    }
}

/// A binary feed frame that could not be decoded. The frame is dropped.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("failed to decode feed frame ({len} bytes): {reason}")]
pub struct DecodeError {
    pub len: usize,
    pub reason: String,
}

/// A tick that is missing a field required by the aggregation state machine. The tick
/// is skipped and no state is touched.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum TickError {
    #[error("tick has no market payload")]
    MissingPayload,

    #[error("tick is missing last traded price/time")]
    MissingLtpc,

    #[error("tick is missing cumulative traded volume")]
    MissingVolume,

    #[error("tick trade time {0} is out of range")]
    InvalidTime(i64),
}

/// A document could not be placed on the aggregate queue and was dropped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum QueueError {
    #[error("aggregate queue full, document dropped ({dropped} dropped in total)")]
    Overloaded { dropped: u64 },

    #[error("aggregate queue closed, batch writer has stopped")]
    Closed,
}

/// Errors returned by an [`AggregateSink`](crate::sink::AggregateSink).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StorageError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("batch insert of {count} documents failed: {reason}")]
    Insert { count: usize, reason: String },

    #[error("failed to serialise document: {0}")]
    Serialise(String),
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::Unavailable(value.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialise(value.to_string())
    }
}

/// Errors returned by a [`ScheduledJob`](crate::scheduler::ScheduledJob). Either variant
/// terminates that job's scheduling loop.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum JobError {
    /// Recognised application failure, eg/ an upstream rejected the request.
    #[error("{0}")]
    App(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<StorageError> for JobError {
    fn from(value: StorageError) -> Self {
        Self::App(value.to_string())
    }
}

/// Failure delivering an operator notification. Always treated as non-fatal.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);
