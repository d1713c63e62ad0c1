use crate::{
    aggregate::{AggregateDocument, ArchivedTick, MinuteVolumeBucket},
    clock::{LocalTime, market_offset},
    error::{FeedError, NotifyError, StorageError},
    feed::{
        MINUTE_CANDLE_INTERVAL,
        connector::{FeedConnector, FeedFrame, FeedStream},
        proto,
    },
    instrument::{Instrument, InstrumentKey},
    notify::Notifier,
    sink::AggregateSink,
    token::TokenSource,
};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone};
use fnv::FnvHashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::{collections::VecDeque, path::PathBuf};

pub fn instrument(key: &str, symbol: &str) -> Instrument {
    Instrument::new(InstrumentKey::new(key), symbol.into())
}

/// 2025-01-20 (a Monday) at the provided market local time.
pub fn time(hour: u32, minute: u32, second: u32) -> LocalTime {
    market_offset()
        .with_ymd_and_hms(2025, 1, 20, hour, minute, second)
        .unwrap()
}

pub fn epoch_ms(hour: u32, minute: u32, second: u32) -> i64 {
    time(hour, minute, second).timestamp_millis()
}

/// Full market payload with an optional `(ts, close)` one-minute candle.
pub fn market_feed(ltp: f64, ltt: i64, vtt: i64, candle: Option<(i64, f64)>) -> proto::Feed {
    let market_ohlc = candle.map(|(ts, close)| proto::MarketOhlc {
        ohlc: vec![
            proto::Ohlc {
                interval: "1d".to_string(),
                open: close,
                high: close,
                low: close,
                close,
                vol: vtt,
                ts,
            },
            proto::Ohlc {
                interval: MINUTE_CANDLE_INTERVAL.to_string(),
                open: close,
                high: close,
                low: close,
                close,
                vol: 10,
                ts,
            },
        ],
    });

    proto::Feed {
        feed_union: Some(proto::feed::FeedUnion::FullFeed(proto::FullFeed {
            full_feed_union: Some(proto::full_feed::FullFeedUnion::MarketFf(
                proto::MarketFullFeed {
                    ltpc: Some(proto::Ltpc {
                        ltp,
                        ltt,
                        ltq: 1,
                        cp: ltp,
                    }),
                    market_ohlc,
                    vtt,
                    oi: 0.0,
                    ..Default::default()
                },
            )),
        })),
        request_mode: proto::RequestMode::FullD5 as i32,
    }
}

pub fn volume_document(key: &str, minute: i64) -> AggregateDocument {
    MinuteVolumeBucket::new(
        &instrument(key, key),
        time(9, 15, 0) + Duration::minutes(minute),
        1,
        0,
        1,
    )
    .into()
}

/// Archived tick received at its own trade time, without a candle snapshot.
pub fn archived_tick(key: &str, ltp: f64, trade_time: LocalTime, vtt: i64) -> ArchivedTick {
    ArchivedTick {
        instrument_key: InstrumentKey::new(key),
        symbol: key.into(),
        received_at: trade_time,
        ltp,
        ltt: trade_time.timestamp_millis(),
        vtt,
        oi: 0.0,
        candle: None,
    }
}

pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("minute-flow-{name}-{}.json", uuid::Uuid::new_v4()))
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.messages.lock().push(text.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    fail: bool,
    batches: Mutex<Vec<Vec<AggregateDocument>>>,
    sessions: Mutex<FnvHashMap<NaiveDate, Vec<AggregateDocument>>>,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }

    pub fn documents(&self) -> Vec<AggregateDocument> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn session_documents(&self, date: NaiveDate) -> Vec<AggregateDocument> {
        self.sessions.lock().get(&date).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl AggregateSink for RecordingSink {
    async fn insert_many(&self, documents: &[AggregateDocument]) -> Result<(), StorageError> {
        if self.fail {
            return Err(StorageError::Insert {
                count: documents.len(),
                reason: "store unreachable".to_string(),
            });
        }
        self.batches.lock().push(documents.to_vec());
        Ok(())
    }

    async fn replace_session(
        &self,
        date: NaiveDate,
        documents: &[AggregateDocument],
    ) -> Result<(), StorageError> {
        if self.fail {
            return Err(StorageError::Insert {
                count: documents.len(),
                reason: "store unreachable".to_string(),
            });
        }
        self.sessions.lock().insert(date, documents.to_vec());
        Ok(())
    }
}

enum Script {
    Fail(FeedError),
    Items(Vec<Result<FeedFrame, FeedError>>),
}

/// Connector replaying scripted outcomes, one per `connect` call.
///
/// Once the script is exhausted every further call fails with a refused connection. Frame
/// streams stay open after their last frame.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<usize>,
}

impl ScriptedConnector {
    pub fn then_fail(self, error: FeedError) -> Self {
        self.script.lock().push_back(Script::Fail(error));
        self
    }

    pub fn then_frames(self, frames: Vec<FeedFrame>) -> Self {
        self.then_items(frames.into_iter().map(Ok).collect())
    }

    pub fn then_items(self, items: Vec<Result<FeedFrame, FeedError>>) -> Self {
        self.script.lock().push_back(Script::Items(items));
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl FeedConnector for ScriptedConnector {
    async fn connect(
        &self,
        _: &str,
        _: &[Instrument],
    ) -> Result<FeedStream, FeedError> {
        *self.calls.lock() += 1;

        let next = self.script.lock().pop_front();
        match next {
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Items(items)) => Ok(futures::stream::iter(items)
                .chain(futures::stream::pending())
                .boxed()),
            None => Err(FeedError::Socket("Io(ConnectionRefused)".to_string())),
        }
    }
}

pub struct StaticTokenSource;

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self, owner: &str) -> Result<String, FeedError> {
        Ok(format!("{owner}-token"))
    }
}
