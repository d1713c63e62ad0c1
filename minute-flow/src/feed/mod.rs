use crate::{
    clock::{LocalTime, floor_minute, local_from_millis},
    error::{DecodeError, TickError},
    instrument::InstrumentKey,
};
use prost::Message;
use serde::{Deserialize, Serialize};

/// Hand-written `prost` models of the upstream protobuf feed.
pub mod proto;

/// Subscription request sent once after connecting.
pub mod subscription;

/// [`FeedConnector`](connector::FeedConnector) transport boundary and its WebSocket adapter.
pub mod connector;

/// Idle read timeout wrapper for transport streams.
pub mod timeout;

/// Interval tag of the feed supplied one-minute candle.
pub const MINUTE_CANDLE_INTERVAL: &str = "I1";

/// Upstream message type.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    InitialFeed,
    LiveFeed,
    MarketInfo,
    Unknown(i32),
}

impl FeedKind {
    /// Only snapshot and live messages carry per-instrument market data.
    pub fn carries_ticks(&self) -> bool {
        matches!(self, FeedKind::InitialFeed | FeedKind::LiveFeed)
    }
}

impl From<i32> for FeedKind {
    fn from(value: i32) -> Self {
        match proto::Type::try_from(value) {
            Ok(proto::Type::InitialFeed) => FeedKind::InitialFeed,
            Ok(proto::Type::LiveFeed) => FeedKind::LiveFeed,
            Ok(proto::Type::MarketInfo) => FeedKind::MarketInfo,
            Err(_) => FeedKind::Unknown(value),
        }
    }
}

/// Payload family an [`InstrumentFeed`] was decoded from.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum FeedSource {
    Market,
    Index,
    LtpcOnly,
    FirstLevel,
    Empty,
}

/// Normalised per-instrument view of one feed entry.
#[derive(Clone, PartialEq, Debug)]
pub struct InstrumentFeed {
    pub source: FeedSource,
    pub ltpc: Option<proto::Ltpc>,
    /// Cumulative traded volume for the session. Absent for index payloads.
    pub vtt: Option<i64>,
    pub oi: f64,
    pub candles: Vec<proto::Ohlc>,
}

/// One accepted price/volume update, ready for the tick aggregation state machine.
#[derive(Clone, PartialEq, Debug)]
pub struct Tick {
    pub instrument: InstrumentKey,
    pub price: f64,
    pub trade_time: LocalTime,
    pub cumulative_volume: i64,
}

/// Feed supplied one-minute candle, timestamped to its local minute.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct CandleSnapshot {
    pub timestamp: LocalTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub open_interest: f64,
}

/// Decoded binary feed frame.
#[derive(Clone, PartialEq, Debug)]
pub struct FeedMessage {
    pub kind: FeedKind,
    /// Upstream send time, epoch milliseconds.
    pub current_ts: i64,
    pub feeds: Vec<(InstrumentKey, InstrumentFeed)>,
}

/// Decode one binary frame from the transport.
pub fn decode_frame(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    let response = proto::FeedResponse::decode(bytes).map_err(|error| DecodeError {
        len: bytes.len(),
        reason: error.to_string(),
    })?;

    Ok(FeedMessage::from(response))
}

impl From<proto::FeedResponse> for FeedMessage {
    fn from(response: proto::FeedResponse) -> Self {
        let mut feeds = response
            .feeds
            .into_iter()
            .map(|(key, feed)| (InstrumentKey::new(key), InstrumentFeed::from(feed)))
            .collect::<Vec<_>>();

        // HashMap order is arbitrary; keep dispatch order reproducible
        feeds.sort_by(|(a, _), (b, _)| a.cmp(b));

        Self {
            kind: FeedKind::from(response.r#type),
            current_ts: response.current_ts,
            feeds,
        }
    }
}

impl From<proto::Feed> for InstrumentFeed {
    fn from(feed: proto::Feed) -> Self {
        use proto::{feed::FeedUnion, full_feed::FullFeedUnion};

        let empty = InstrumentFeed {
            source: FeedSource::Empty,
            ltpc: None,
            vtt: None,
            oi: 0.0,
            candles: Vec::new(),
        };

        match feed.feed_union {
            Some(FeedUnion::FullFeed(full)) => match full.full_feed_union {
                Some(FullFeedUnion::MarketFf(market)) => InstrumentFeed {
                    source: FeedSource::Market,
                    ltpc: market.ltpc,
                    vtt: Some(market.vtt),
                    oi: market.oi,
                    candles: market.market_ohlc.map(|ohlc| ohlc.ohlc).unwrap_or_default(),
                },
                Some(FullFeedUnion::IndexFf(index)) => InstrumentFeed {
                    source: FeedSource::Index,
                    ltpc: index.ltpc,
                    candles: index.market_ohlc.map(|ohlc| ohlc.ohlc).unwrap_or_default(),
                    ..empty
                },
                None => empty,
            },
            Some(FeedUnion::Ltpc(ltpc)) => InstrumentFeed {
                source: FeedSource::LtpcOnly,
                ltpc: Some(ltpc),
                ..empty
            },
            Some(FeedUnion::FirstLevelWithGreeks(first)) => InstrumentFeed {
                source: FeedSource::FirstLevel,
                ltpc: first.ltpc,
                vtt: Some(first.vtt),
                oi: first.oi,
                ..empty
            },
            None => empty,
        }
    }
}

impl InstrumentFeed {
    /// Extract a [`Tick`] for the volume state machine.
    ///
    /// Proto3 scalars cannot express absence, so a zero price, trade time or cumulative
    /// volume is treated as a missing field and the tick is rejected.
    pub fn tick(&self, instrument: &InstrumentKey) -> Result<Tick, TickError> {
        if self.source != FeedSource::Market {
            return Err(TickError::MissingPayload);
        }

        let ltpc = self.ltpc.as_ref().ok_or(TickError::MissingLtpc)?;
        if ltpc.ltp == 0.0 || ltpc.ltt == 0 {
            return Err(TickError::MissingLtpc);
        }

        let cumulative_volume = match self.vtt {
            Some(vtt) if vtt != 0 => vtt,
            _ => return Err(TickError::MissingVolume),
        };

        let trade_time = local_from_millis(ltpc.ltt).ok_or(TickError::InvalidTime(ltpc.ltt))?;

        Ok(Tick {
            instrument: instrument.clone(),
            price: ltpc.ltp,
            trade_time,
            cumulative_volume,
        })
    }

    /// The feed's own in-progress one-minute candle, if present.
    pub fn minute_candle(&self) -> Option<CandleSnapshot> {
        let candle = self
            .candles
            .iter()
            .find(|candle| candle.interval == MINUTE_CANDLE_INTERVAL)?;

        let timestamp = local_from_millis(candle.ts).filter(|_| candle.ts != 0)?;

        Some(CandleSnapshot {
            timestamp: floor_minute(timestamp),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.vol,
            open_interest: self.oi,
        })
    }
}
