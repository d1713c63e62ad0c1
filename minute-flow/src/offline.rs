//! Offline reconstruction of minute buckets and candles from the raw tick archive.
//!
//! Unlike the online [`VolumeTracker`](crate::aggregate::VolumeTracker), the offline path emits
//! a bucket for every session minute: minutes without ticks are zero filled. Outputs of the two
//! paths therefore only agree on minutes in which the instrument traded.

use crate::{
    aggregate::{AggregateDocument, ArchivedTick, Candle, Direction, MinuteVolumeBucket},
    clock::{LocalTime, TradingSession, now_local},
    error::JobError,
    instrument::{Instrument, InstrumentKey},
    scheduler::ScheduledJob,
    sink::{AggregateSink, TickArchive},
};
use async_trait::async_trait;
use chrono::NaiveDate;
use fnv::FnvHashSet;
use itertools::Itertools;
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Row {
    time: LocalTime,
    price: f64,
    cumulative_volume: i64,
}

/// Rebuild one-minute volume buckets for a single instrument over a full session.
pub fn reaggregate_volume(
    instrument: &Instrument,
    ticks: &[ArchivedTick],
    session: &TradingSession,
) -> Vec<MinuteVolumeBucket> {
    reaggregate_volume_buckets(instrument, ticks, session, 1)
}

/// As [`reaggregate_volume`], with `bucket_minutes` wide buckets stepping from the session open.
pub fn reaggregate_volume_buckets(
    instrument: &Instrument,
    ticks: &[ArchivedTick],
    session: &TradingSession,
    bucket_minutes: u32,
) -> Vec<MinuteVolumeBucket> {
    let mut rows = ticks
        .iter()
        .filter_map(|tick| {
            Some(Row {
                time: tick.trade_time()?,
                price: tick.ltp,
                cumulative_volume: tick.vtt,
            })
        })
        .collect::<Vec<_>>();

    // Stable, so equal timestamps keep archive order
    rows.sort_by_key(|row| row.time);

    let mut seen = FnvHashSet::default();
    rows.retain(|row| seen.insert((row.price.to_bits(), row.time)));

    let mut totals = BTreeMap::<LocalTime, (u64, u64, u64)>::new();
    let mut previous: Option<Row> = None;
    let mut direction = Direction::Neutral;

    for row in rows {
        let delta = previous
            .map(|prev| row.cumulative_volume.saturating_sub(prev.cumulative_volume).max(0) as u64)
            .unwrap_or(0);
        direction = Direction::classify(previous.map(|prev| prev.price), row.price, direction);

        let (buy, sell, total) = totals
            .entry(session.floor_bucket(row.time, bucket_minutes))
            .or_default();
        match direction {
            Direction::Buy => *buy += delta,
            Direction::Sell => *sell += delta,
            Direction::Neutral => {}
        }
        *total += delta;

        previous = Some(row);
    }

    totals.retain(|minute, _| session.contains(minute));
    let Some(session_date) = totals.keys().next().map(|minute| minute.date_naive()) else {
        return Vec::new();
    };

    let mut net_delta = 0;
    session
        .bucket_starts(session_date, bucket_minutes)
        .into_iter()
        .map(|minute| {
            let (buy, sell, total) = totals.get(&minute).copied().unwrap_or_default();
            let mut bucket = MinuteVolumeBucket::new(instrument, minute, buy, sell, total);
            net_delta += bucket.delta;
            bucket.net_delta = Some(net_delta);
            bucket
        })
        .collect()
}

/// The last archived one-minute candle snapshot of every session minute, in time order.
pub fn unique_minute_candles(
    instrument: &Instrument,
    ticks: &[ArchivedTick],
    session: &TradingSession,
) -> Vec<Candle> {
    ticks
        .iter()
        .filter_map(|tick| tick.candle)
        .filter(|snapshot| session.contains(&snapshot.timestamp))
        .map(|snapshot| (snapshot.timestamp, snapshot))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .map(|snapshot| Candle::from_snapshot(instrument, &snapshot))
        .collect()
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub instruments: usize,
    pub ticks: usize,
    pub buckets: usize,
    pub candles: usize,
}

/// Rebuilds the current session's buckets and candles from the tick archive.
///
/// Each pass replaces the previous reconciled output for the date, so re-running is idempotent.
pub struct SessionReconciler {
    archive: Arc<dyn TickArchive>,
    sink: Arc<dyn AggregateSink>,
    session: TradingSession,
    bucket_minutes: u32,
}

impl SessionReconciler {
    pub const NAME: &'static str = "reconcile";

    pub fn new(
        archive: Arc<dyn TickArchive>,
        sink: Arc<dyn AggregateSink>,
        session: TradingSession,
    ) -> Self {
        Self {
            archive,
            sink,
            session,
            bucket_minutes: 1,
        }
    }

    pub fn with_bucket_minutes(mut self, bucket_minutes: u32) -> Self {
        self.bucket_minutes = bucket_minutes.max(1);
        self
    }

    pub async fn reconcile(&self, date: NaiveDate) -> Result<ReconcileReport, JobError> {
        let ticks = self.archive.ticks_on(date).await?;

        let by_instrument = ticks
            .into_iter()
            .into_group_map_by(|tick| tick.instrument_key.clone())
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .collect::<Vec<(InstrumentKey, Vec<ArchivedTick>)>>();

        let mut report = ReconcileReport {
            instruments: by_instrument.len(),
            ..ReconcileReport::default()
        };
        let mut documents = Vec::new();

        for (key, ticks) in by_instrument {
            let symbol = ticks
                .first()
                .map(|tick| tick.symbol.clone())
                .unwrap_or_default();
            let instrument = Instrument::new(key, symbol);

            let buckets =
                reaggregate_volume_buckets(&instrument, &ticks, &self.session, self.bucket_minutes);
            let candles = unique_minute_candles(&instrument, &ticks, &self.session);

            report.ticks += ticks.len();
            report.buckets += buckets.len();
            report.candles += candles.len();

            documents.extend(buckets.into_iter().map(AggregateDocument::from));
            documents.extend(candles.into_iter().map(AggregateDocument::from));
        }

        self.sink.replace_session(date, &documents).await?;

        info!(
            %date,
            instruments = report.instruments,
            ticks = report.ticks,
            buckets = report.buckets,
            candles = report.candles,
            "reconciled session from tick archive"
        );
        Ok(report)
    }
}

#[async_trait]
impl ScheduledJob for SessionReconciler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), JobError> {
        self.reconcile(now_local().date_naive()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::VolumeTracker,
        error::StorageError,
        feed::{CandleSnapshot, Tick},
        test_util::{RecordingSink, archived_tick, instrument, time},
    };

    fn with_candle(mut tick: ArchivedTick, minute: LocalTime, close: f64) -> ArchivedTick {
        tick.candle = Some(CandleSnapshot {
            timestamp: minute,
            open: 100.0,
            high: close.max(100.0),
            low: close.min(100.0),
            close,
            volume: 1,
            open_interest: 0.0,
        });
        tick
    }

    #[test]
    fn test_reaggregate_volume_worked_example() {
        let x = instrument("X", "X");
        let ticks = vec![
            archived_tick("X", 100.0, time(9, 15, 5), 1000),
            archived_tick("X", 100.5, time(9, 15, 20), 1050),
            archived_tick("X", 100.5, time(9, 16, 1), 1050),
        ];

        let actual = reaggregate_volume(&x, &ticks, &TradingSession::default());
        assert_eq!(actual.len(), 375);

        assert_eq!(actual[0].minute, time(9, 15, 0));
        assert_eq!((actual[0].buy, actual[0].sell, actual[0].total), (50, 0, 50));
        assert_eq!(actual[0].delta, 50);
        assert_eq!(actual[0].net_delta, Some(50));
        assert_eq!(actual[0].symbol, "X");

        assert_eq!(actual[374].minute, time(15, 29, 0));
        assert_eq!(actual[374].total, 0);
        assert_eq!(actual[374].net_delta, Some(50));
    }

    #[test]
    fn test_reaggregate_volume_sorts_dedupes_and_clamps() {
        let x = instrument("X", "X");
        let ticks = vec![
            archived_tick("X", 101.0, time(9, 15, 20), 1100),
            archived_tick("X", 100.0, time(9, 15, 5), 1000),
            // Exact duplicate of the first row
            archived_tick("X", 100.0, time(9, 15, 5), 1000),
            // Counter reset is clamped to zero
            archived_tick("X", 99.0, time(9, 15, 30), 10),
            // Unchanged price keeps the sell direction
            archived_tick("X", 99.0, time(9, 15, 40), 40),
        ];

        let actual = reaggregate_volume(&x, &ticks, &TradingSession::default());
        assert_eq!((actual[0].buy, actual[0].sell, actual[0].total), (100, 30, 130));
        assert_eq!(actual[0].delta, 70);
    }

    #[test]
    fn test_reaggregate_volume_net_delta_and_session_window() {
        let x = instrument("X", "X");
        let ticks = vec![
            // Pre-open ticks fall outside the session window
            archived_tick("X", 100.0, time(9, 10, 0), 500),
            archived_tick("X", 100.0, time(9, 15, 0), 1000),
            archived_tick("X", 101.0, time(9, 15, 30), 1040),
            archived_tick("X", 100.0, time(9, 17, 10), 1100),
            // After the last session bucket
            archived_tick("X", 105.0, time(15, 30, 10), 2000),
        ];

        let actual = reaggregate_volume(&x, &ticks, &TradingSession::default());
        assert_eq!(actual.len(), 375);

        let deltas = actual
            .iter()
            .take(3)
            .map(|bucket| (bucket.delta, bucket.net_delta))
            .collect::<Vec<_>>();

        // 09:15 carries the 500 lot delta of the first session tick as neutral
        assert_eq!(actual[0].total, 540);
        assert_eq!(deltas, vec![(40, Some(40)), (0, Some(40)), (-60, Some(-20))]);
        assert_eq!(actual.last().unwrap().net_delta, Some(-20));
    }

    #[test]
    fn test_reaggregate_volume_empty_inputs() {
        let x = instrument("X", "X");
        let session = TradingSession::default();

        assert!(reaggregate_volume(&x, &[], &session).is_empty());

        let outside = vec![archived_tick("X", 100.0, time(8, 0, 0), 10)];
        assert!(reaggregate_volume(&x, &outside, &session).is_empty());
    }

    #[test]
    fn test_reaggregate_volume_wide_buckets_step_from_open() {
        let x = instrument("X", "X");
        let ticks = vec![
            archived_tick("X", 100.0, time(9, 21, 0), 1000),
            archived_tick("X", 101.0, time(9, 22, 0), 1500),
            archived_tick("X", 102.0, time(9, 33, 0), 2500),
        ];

        let actual = reaggregate_volume_buckets(&x, &ticks, &TradingSession::default(), 10);
        assert_eq!(actual.len(), 38);

        assert_eq!(actual[0].minute, time(9, 15, 0));
        assert_eq!((actual[0].buy, actual[0].sell, actual[0].total), (500, 0, 500));
        assert_eq!(actual[1].minute, time(9, 25, 0));
        assert_eq!((actual[1].buy, actual[1].sell, actual[1].total), (1000, 0, 1000));

        let total = actual.iter().map(|bucket| bucket.total).sum::<u64>();
        assert_eq!(total, 1500);
        assert_eq!(actual.last().unwrap().net_delta, Some(1500));
    }

    #[test]
    fn test_offline_and_online_agree_on_traded_minutes() {
        let x = instrument("X", "X");
        let raw = [
            (100.0, time(9, 15, 10), 1000),
            (100.5, time(9, 15, 40), 1020),
            (100.0, time(9, 16, 5), 1030),
            // 09:17 to 09:21 silent
            (101.0, time(9, 22, 5), 1100),
            (101.5, time(9, 23, 0), 1110),
        ];

        let mut tracker = VolumeTracker::new(&[x.clone()]);
        let online = raw
            .iter()
            .filter_map(|&(price, trade_time, cumulative_volume)| {
                tracker.on_tick(&Tick {
                    instrument: x.key.clone(),
                    price,
                    trade_time,
                    cumulative_volume,
                })
            })
            .collect::<Vec<_>>();

        let ticks = raw
            .iter()
            .map(|&(price, trade_time, vtt)| archived_tick("X", price, trade_time, vtt))
            .collect::<Vec<_>>();
        let offline = reaggregate_volume(&x, &ticks, &TradingSession::default());

        // Online closed 09:15, 09:16 and 09:22 but has no bucket for the silent minutes
        assert_eq!(
            online.iter().map(|bucket| bucket.minute).collect::<Vec<_>>(),
            vec![time(9, 15, 0), time(9, 16, 0), time(9, 22, 0)]
        );

        for bucket in &online {
            let matching = offline
                .iter()
                .find(|offline| offline.minute == bucket.minute)
                .unwrap();
            assert_eq!(
                (matching.buy, matching.sell, matching.total),
                (bucket.buy, bucket.sell, bucket.total),
                "minute {} disagrees",
                bucket.minute
            );
        }

        let silent = offline
            .iter()
            .filter(|bucket| bucket.minute >= time(9, 17, 0) && bucket.minute <= time(9, 21, 0))
            .collect::<Vec<_>>();
        assert_eq!(silent.len(), 5);
        assert!(
            silent
                .iter()
                .all(|bucket| (bucket.buy, bucket.sell, bucket.total) == (0, 0, 0))
        );
        assert_eq!(offline.len(), 375);
    }

    #[test]
    fn test_unique_minute_candles_keeps_last_snapshot() {
        let x = instrument("X", "X");
        let ticks = vec![
            with_candle(archived_tick("X", 100.0, time(9, 15, 5), 1), time(9, 15, 0), 100.0),
            with_candle(archived_tick("X", 101.0, time(9, 15, 50), 2), time(9, 15, 0), 101.0),
            with_candle(archived_tick("X", 99.0, time(9, 16, 2), 3), time(9, 16, 0), 99.0),
            with_candle(archived_tick("X", 99.0, time(9, 14, 2), 3), time(9, 14, 0), 99.0),
            archived_tick("X", 99.0, time(9, 16, 3), 4),
        ];

        let actual = unique_minute_candles(&x, &ticks, &TradingSession::default());
        assert_eq!(actual.len(), 2);
        assert_eq!(actual[0].timestamp, time(9, 15, 0));
        assert_eq!(actual[0].close, 101.0);
        assert_eq!(actual[1].timestamp, time(9, 16, 0));
    }

    struct StaticArchive(Vec<ArchivedTick>);

    #[async_trait]
    impl TickArchive for StaticArchive {
        async fn ticks_on(&self, _: NaiveDate) -> Result<Vec<ArchivedTick>, StorageError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_session_reconciler_writes_every_instrument() {
        let archive = StaticArchive(vec![
            with_candle(archived_tick("B", 10.0, time(9, 15, 5), 100), time(9, 15, 0), 10.0),
            archived_tick("A", 100.0, time(9, 15, 5), 1000),
            archived_tick("B", 10.5, time(9, 15, 6), 150),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let reconciler = SessionReconciler::new(
            Arc::new(archive),
            sink.clone(),
            TradingSession::default(),
        );

        let actual = reconciler
            .reconcile(time(9, 0, 0).date_naive())
            .await
            .unwrap();

        assert_eq!(
            actual,
            ReconcileReport {
                instruments: 2,
                ticks: 3,
                buckets: 750,
                candles: 1,
            }
        );
        let date = time(9, 0, 0).date_naive();
        assert!(sink.batch_sizes().is_empty());
        assert_eq!(sink.session_documents(date).len(), 751);
        assert_eq!(sink.session_documents(date)[0].instrument_key(), &InstrumentKey::new("A"));
        assert_eq!(reconciler.name(), "reconcile");
    }

    #[tokio::test]
    async fn test_session_reconciler_rerun_replaces_previous_output() {
        let date = time(9, 0, 0).date_naive();
        let sink = Arc::new(RecordingSink::default());
        let reconciler = SessionReconciler::new(
            Arc::new(StaticArchive(vec![
                archived_tick("A", 100.0, time(9, 15, 5), 1000),
                archived_tick("A", 100.5, time(9, 15, 20), 1050),
            ])),
            sink.clone(),
            TradingSession::default(),
        );

        let first = reconciler.reconcile(date).await.unwrap();
        let second = reconciler.reconcile(date).await.unwrap();
        assert_eq!(first, second);

        let documents = sink.session_documents(date);
        assert_eq!(documents.len(), 375);

        let minutes = documents
            .iter()
            .filter_map(|document| match document {
                AggregateDocument::Volume(bucket) => Some(bucket.minute),
                _ => None,
            })
            .collect::<FnvHashSet<_>>();
        assert_eq!(minutes.len(), 375);
        assert!(sink.documents().is_empty());
    }

    #[tokio::test]
    async fn test_session_reconciler_storage_failure_is_app_error() {
        let reconciler = SessionReconciler::new(
            Arc::new(StaticArchive(vec![archived_tick("A", 1.0, time(9, 15, 0), 1)])),
            Arc::new(RecordingSink::failing()),
            TradingSession::default(),
        );

        let actual = reconciler.reconcile(time(9, 0, 0).date_naive()).await;
        assert!(matches!(actual, Err(JobError::App(_))));
    }
}
