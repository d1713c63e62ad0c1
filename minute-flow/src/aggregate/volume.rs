//! Online tick aggregation into one-minute buy/sell/total volume buckets.
//!
//! Each instrument owns a [`TickState`]. A bucket is closed only when a tick belonging to a
//! later minute arrives, so a minute in which an instrument does not trade produces no bucket.

use crate::{
    aggregate::document::MinuteVolumeBucket,
    clock::{LocalTime, floor_minute},
    feed::Tick,
    instrument::{Instrument, InstrumentKey},
};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Trade direction inferred from the tick rule.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Neutral,
    Buy,
    Sell,
}

impl Direction {
    /// Classify `price` against the previous price, carrying `previous` forward on no change.
    pub fn classify(last_price: Option<f64>, price: f64, previous: Direction) -> Self {
        match last_price {
            None => Direction::Neutral,
            Some(last) if price > last => Direction::Buy,
            Some(last) if price < last => Direction::Sell,
            Some(_) => previous,
        }
    }
}

/// Accumulators of a minute that has just been closed.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ClosedMinute {
    pub minute: LocalTime,
    pub buy: u64,
    pub sell: u64,
    pub total: u64,
}

/// Per-instrument tick state for one feed session.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct TickState {
    last_direction: Direction,
    last_trade_key: Option<(f64, LocalTime)>,
    last_cumulative_volume: Option<i64>,
    last_price: Option<f64>,
    last_trade_time: Option<LocalTime>,
    minute_buy: u64,
    minute_sell: u64,
    minute_total: u64,
}

impl TickState {
    /// Apply one tick, returning the previous minute's accumulators if this tick closed it.
    pub fn apply(
        &mut self,
        price: f64,
        trade_time: LocalTime,
        cumulative_volume: i64,
    ) -> Option<ClosedMinute> {
        // Retransmission of the unchanged last trade
        if self.last_trade_key == Some((price, trade_time)) {
            return None;
        }
        self.last_trade_key = Some((price, trade_time));

        // Session counter resets produce negative deltas, clamp them away
        let delta = self
            .last_cumulative_volume
            .map(|last| cumulative_volume.saturating_sub(last).max(0) as u64)
            .unwrap_or(0);
        self.last_cumulative_volume = Some(cumulative_volume);

        let closed = match self.last_trade_time {
            Some(previous) if floor_minute(previous) != floor_minute(trade_time) => {
                Some(self.take_minute(floor_minute(previous)))
            }
            _ => None,
        };

        let direction = Direction::classify(self.last_price, price, self.last_direction);
        self.last_direction = direction;
        self.last_price = Some(price);

        if delta > 0 {
            match direction {
                Direction::Buy => self.minute_buy += delta,
                Direction::Sell => self.minute_sell += delta,
                Direction::Neutral => {}
            }
        }
        self.minute_total += delta;

        self.last_trade_time = Some(trade_time);

        closed
    }

    fn take_minute(&mut self, minute: LocalTime) -> ClosedMinute {
        let closed = ClosedMinute {
            minute,
            buy: self.minute_buy,
            sell: self.minute_sell,
            total: self.minute_total,
        };
        self.minute_buy = 0;
        self.minute_sell = 0;
        self.minute_total = 0;
        closed
    }

    pub fn last_direction(&self) -> Direction {
        self.last_direction
    }

    /// Accumulators of the minute still open, as `(buy, sell, total)`.
    pub fn open_minute(&self) -> (u64, u64, u64) {
        (self.minute_buy, self.minute_sell, self.minute_total)
    }
}

#[derive(Clone, Debug)]
struct Tracked {
    instrument: Instrument,
    state: TickState,
}

/// Minute volume aggregation across every subscribed instrument.
#[derive(Clone, Debug, Default)]
pub struct VolumeTracker {
    instruments: FnvHashMap<InstrumentKey, Tracked>,
}

impl VolumeTracker {
    pub fn new<'a>(instruments: impl IntoIterator<Item = &'a Instrument>) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|instrument| {
                    (
                        instrument.key.clone(),
                        Tracked {
                            instrument: instrument.clone(),
                            state: TickState::default(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Feed a decoded tick, returning a [`MinuteVolumeBucket`] if it closed a minute.
    ///
    /// Ticks for instruments outside the subscribed set are ignored.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<MinuteVolumeBucket> {
        let Some(tracked) = self.instruments.get_mut(&tick.instrument) else {
            debug!(instrument = %tick.instrument, "ignoring tick for unsubscribed instrument");
            return None;
        };

        tracked
            .state
            .apply(tick.price, tick.trade_time, tick.cumulative_volume)
            .map(|closed| {
                MinuteVolumeBucket::new(
                    &tracked.instrument,
                    closed.minute,
                    closed.buy,
                    closed.sell,
                    closed.total,
                )
            })
    }

    pub fn state(&self, key: &InstrumentKey) -> Option<&TickState> {
        self.instruments.get(key).map(|tracked| &tracked.state)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}
