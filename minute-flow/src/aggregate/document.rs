use crate::{
    clock::{LocalTime, local_from_millis},
    feed::{CandleSnapshot, InstrumentFeed},
    instrument::{Instrument, InstrumentKey},
};
use derive_more::From;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Closed one-minute volume bucket for a single instrument.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MinuteVolumeBucket {
    pub instrument_key: InstrumentKey,
    pub symbol: SmolStr,
    /// Bucket start, seconds truncated.
    pub minute: LocalTime,
    pub buy: u64,
    pub sell: u64,
    pub total: u64,
    /// `buy - sell`
    pub delta: i64,
    /// Running session sum of `delta`. Only the offline reconstruction sets this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_delta: Option<i64>,
}

impl MinuteVolumeBucket {
    pub fn new(instrument: &Instrument, minute: LocalTime, buy: u64, sell: u64, total: u64) -> Self {
        Self {
            instrument_key: instrument.key.clone(),
            symbol: instrument.symbol.clone(),
            minute,
            buy,
            sell,
            total,
            delta: buy as i64 - sell as i64,
            net_delta: None,
        }
    }
}

/// Closed OHLC candle for a single instrument.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub instrument_key: InstrumentKey,
    pub symbol: SmolStr,
    pub timestamp: LocalTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub open_interest: f64,
}

impl Candle {
    pub fn from_snapshot(instrument: &Instrument, snapshot: &CandleSnapshot) -> Self {
        Self {
            instrument_key: instrument.key.clone(),
            symbol: instrument.symbol.clone(),
            timestamp: snapshot.timestamp,
            open: snapshot.open,
            high: snapshot.high,
            low: snapshot.low,
            close: snapshot.close,
            volume: snapshot.volume,
            open_interest: snapshot.open_interest,
        }
    }
}

/// Raw tick as archived for offline reconstruction.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ArchivedTick {
    pub instrument_key: InstrumentKey,
    pub symbol: SmolStr,
    pub received_at: LocalTime,
    pub ltp: f64,
    /// Last trade time, epoch milliseconds.
    pub ltt: i64,
    /// Cumulative traded volume.
    pub vtt: i64,
    pub oi: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candle: Option<CandleSnapshot>,
}

impl ArchivedTick {
    /// Snapshot a market payload. Returns `None` if it carries no last traded price.
    pub fn from_feed(
        instrument: &Instrument,
        received_at: LocalTime,
        feed: &InstrumentFeed,
    ) -> Option<Self> {
        let ltpc = feed.ltpc.as_ref()?;
        Some(Self {
            instrument_key: instrument.key.clone(),
            symbol: instrument.symbol.clone(),
            received_at,
            ltp: ltpc.ltp,
            ltt: ltpc.ltt,
            vtt: feed.vtt.unwrap_or_default(),
            oi: feed.oi,
            candle: feed.minute_candle(),
        })
    }

    pub fn trade_time(&self) -> Option<LocalTime> {
        local_from_millis(self.ltt).filter(|_| self.ltt != 0)
    }
}

/// Item placed on the aggregate queue and written by the batch writer.
#[derive(Clone, PartialEq, Debug, From, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateDocument {
    Volume(MinuteVolumeBucket),
    Candle(Candle),
    Tick(ArchivedTick),
}

impl AggregateDocument {
    pub fn instrument_key(&self) -> &InstrumentKey {
        match self {
            AggregateDocument::Volume(bucket) => &bucket.instrument_key,
            AggregateDocument::Candle(candle) => &candle.instrument_key,
            AggregateDocument::Tick(tick) => &tick.instrument_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{instrument, time};

    #[test]
    fn test_de_aggregate_document() {
        let input = r#"{
            "kind": "volume",
            "instrument_key": "NSE_EQ|X",
            "symbol": "X",
            "minute": "2025-01-20T09:15:00+05:30",
            "buy": 50,
            "sell": 0,
            "total": 50,
            "delta": 50
        }"#;

        let actual = serde_json::from_str::<AggregateDocument>(input).unwrap();
        let expected = AggregateDocument::Volume(MinuteVolumeBucket::new(
            &instrument("NSE_EQ|X", "X"),
            time(9, 15, 0),
            50,
            0,
            50,
        ));

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_ser_aggregate_document_tags_kind() {
        let bucket = MinuteVolumeBucket::new(&instrument("NSE_EQ|X", "X"), time(9, 15, 0), 3, 8, 12);
        assert_eq!(bucket.delta, -5);

        let actual = serde_json::to_value(AggregateDocument::from(bucket)).unwrap();
        assert_eq!(actual["kind"], "volume");
        assert_eq!(actual["delta"], -5);
        assert!(actual.get("net_delta").is_none());
    }
}
