use crate::{
    aggregate::{AggregateDocument, ArchivedTick, CandleTracker, VolumeTracker},
    clock::{LocalTime, now_local},
    error::{DecodeError, QueueError, TickError},
    feed::{FeedMessage, FeedSource, decode_frame},
    instrument::{Instrument, InstrumentKey},
    pipeline::QueueSender,
};
use fnv::FnvHashMap;
use tracing::{debug, trace, warn};

/// Counters for a single feed session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub decode_errors: u64,
    pub ticks: u64,
    pub rejected_ticks: u64,
    pub buckets: u64,
    pub candles: u64,
    pub archived: u64,
    pub shed: u64,
}

/// Per-connection aggregation state for every subscribed instrument.
///
/// Created when the instrument list is loaded at connection start and dropped on teardown,
/// so an open minute spanning a disconnect is lost.
#[derive(Debug)]
pub struct FeedSession {
    instruments: FnvHashMap<InstrumentKey, Instrument>,
    volume: VolumeTracker,
    candles: CandleTracker,
    queue: QueueSender,
    archive_ticks: bool,
    stats: SessionStats,
}

impl FeedSession {
    pub fn new(instruments: &[Instrument], queue: QueueSender, archive_ticks: bool) -> Self {
        Self {
            instruments: instruments
                .iter()
                .map(|instrument| (instrument.key.clone(), instrument.clone()))
                .collect(),
            volume: VolumeTracker::new(instruments),
            candles: CandleTracker::new(instruments),
            queue,
            archive_ticks,
            stats: SessionStats::default(),
        }
    }

    /// Decode a binary frame and dispatch it. A malformed frame is counted and dropped.
    pub fn on_frame(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.stats.frames += 1;

        let message = decode_frame(bytes).inspect_err(|error| {
            self.stats.decode_errors += 1;
            warn!(%error, "dropping undecodable feed frame");
        })?;

        self.on_message(message, now_local());
        Ok(())
    }

    /// Dispatch every instrument entry of a decoded message, in instrument key order.
    pub fn on_message(&mut self, message: FeedMessage, received_at: LocalTime) {
        if !message.kind.carries_ticks() {
            trace!(kind = ?message.kind, "ignoring feed message without market data");
            return;
        }

        for (key, feed) in message.feeds {
            let Some(instrument) = self.instruments.get(&key) else {
                debug!(instrument = %key, "ignoring feed entry for unsubscribed instrument");
                continue;
            };

            if self.archive_ticks && feed.source == FeedSource::Market {
                if let Some(tick) = ArchivedTick::from_feed(instrument, received_at, &feed) {
                    self.stats.archived += 1;
                    Self::enqueue(&self.queue, &mut self.stats, tick.into());
                }
            }

            match feed.tick(&key) {
                Ok(tick) => {
                    self.stats.ticks += 1;
                    if let Some(bucket) = self.volume.on_tick(&tick) {
                        self.stats.buckets += 1;
                        Self::enqueue(&self.queue, &mut self.stats, bucket.into());
                    }
                }
                // Index payloads carry no traded volume
                Err(TickError::MissingPayload) => {}
                Err(error) => {
                    self.stats.rejected_ticks += 1;
                    debug!(instrument = %key, %error, "skipping incomplete tick");
                }
            }

            let closed = feed
                .minute_candle()
                .and_then(|snapshot| self.candles.observe(&key, snapshot));
            if let Some(candle) = closed {
                self.stats.candles += 1;
                Self::enqueue(&self.queue, &mut self.stats, candle.into());
            }
        }
    }

    /// Enqueue every held candle. Used on an operator stop, when no successor will arrive.
    pub fn drain_candles(&mut self) -> usize {
        let drained = self.candles.drain();
        let count = drained.len();
        for candle in drained {
            self.stats.candles += 1;
            Self::enqueue(&self.queue, &mut self.stats, candle.into());
        }
        count
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn instruments(&self) -> usize {
        self.instruments.len()
    }

    fn enqueue(queue: &QueueSender, stats: &mut SessionStats, document: AggregateDocument) {
        match queue.push(document) {
            Ok(()) => {}
            Err(QueueError::Overloaded { .. }) => stats.shed += 1,
            Err(error @ QueueError::Closed) => {
                stats.shed += 1;
                warn!(%error, "aggregate document lost");
            }
        }
    }
}
