use crate::{
    aggregate::document::Candle,
    feed::CandleSnapshot,
    instrument::{Instrument, InstrumentKey},
};
use fnv::FnvHashMap;

#[derive(Clone, Debug)]
struct Held {
    instrument: Instrument,
    current: Option<CandleSnapshot>,
}

/// Tracks the feed's in-progress one-minute candle per instrument and emits each candle
/// once, when a snapshot with a different timestamp supersedes it.
#[derive(Clone, Debug, Default)]
pub struct CandleTracker {
    instruments: FnvHashMap<InstrumentKey, Held>,
}

impl CandleTracker {
    pub fn new<'a>(instruments: impl IntoIterator<Item = &'a Instrument>) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|instrument| {
                    (
                        instrument.key.clone(),
                        Held {
                            instrument: instrument.clone(),
                            current: None,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn observe(&mut self, key: &InstrumentKey, snapshot: CandleSnapshot) -> Option<Candle> {
        let held = self.instruments.get_mut(key)?;

        match held.current.replace(snapshot) {
            Some(previous) if previous.timestamp != snapshot.timestamp => {
                Some(Candle::from_snapshot(&held.instrument, &previous))
            }
            _ => None,
        }
    }

    /// Emit every held candle, leaving the tracker empty.
    pub fn drain(&mut self) -> Vec<Candle> {
        let mut drained = self
            .instruments
            .values_mut()
            .filter_map(|held| {
                held.current
                    .take()
                    .map(|current| Candle::from_snapshot(&held.instrument, &current))
            })
            .collect::<Vec<_>>();

        drained.sort_by(|a, b| a.instrument_key.cmp(&b.instrument_key));
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::LocalTime,
        test_util::{instrument, time},
    };

    fn snapshot(timestamp: LocalTime, close: f64) -> CandleSnapshot {
        CandleSnapshot {
            timestamp,
            open: 100.0,
            high: close.max(100.0),
            low: close.min(100.0),
            close,
            volume: 10,
            open_interest: 0.0,
        }
    }

    #[test]
    fn test_candle_tracker_observe() {
        let key = InstrumentKey::new("X");
        let mut tracker = CandleTracker::new(&[instrument("X", "X")]);

        // First snapshot is held
        assert_eq!(tracker.observe(&key, snapshot(time(9, 15, 0), 101.0)), None);

        // Same minute: last write wins, nothing emitted
        assert_eq!(tracker.observe(&key, snapshot(time(9, 15, 0), 102.0)), None);

        // New minute closes the held candle with its latest values
        let actual = tracker
            .observe(&key, snapshot(time(9, 16, 0), 99.0))
            .unwrap();
        assert_eq!(actual.timestamp, time(9, 15, 0));
        assert_eq!(actual.close, 102.0);
        assert_eq!(actual.symbol, "X");
    }

    #[test]
    fn test_candle_tracker_drain() {
        let mut tracker = CandleTracker::new(&[instrument("A", "A"), instrument("B", "B")]);

        tracker.observe(&InstrumentKey::new("B"), snapshot(time(15, 29, 0), 101.0));
        tracker.observe(&InstrumentKey::new("A"), snapshot(time(15, 29, 0), 98.0));

        let actual = tracker.drain();
        assert_eq!(actual.len(), 2);
        assert_eq!(actual[0].instrument_key, InstrumentKey::new("A"));
        assert_eq!(actual[1].close, 101.0);

        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn test_candle_tracker_ignores_unknown_instrument() {
        let mut tracker = CandleTracker::new(&[instrument("A", "A")]);
        let key = InstrumentKey::new("Z");

        assert_eq!(tracker.observe(&key, snapshot(time(9, 15, 0), 1.0)), None);
        assert_eq!(tracker.observe(&key, snapshot(time(9, 16, 0), 1.0)), None);
    }
}
