//! Trading-region local time.
//!
//! The feed stamps every tick with integer milliseconds since the Unix epoch. All bucketing
//! (minute volume buckets, candle minutes, session windows, scheduler alignment) happens in
//! the exchange's fixed local offset, which never observes daylight saving.

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

/// Local time as used throughout the crate.
pub type LocalTime = DateTime<FixedOffset>;

/// India Standard Time offset (UTC+05:30) in seconds.
pub const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Fixed trading-region offset.
pub fn market_offset() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Current wall clock time in market local time.
pub fn now_local() -> LocalTime {
    Utc::now().with_timezone(&market_offset())
}

/// Convert a feed timestamp (epoch milliseconds) into market local time.
///
/// Returns `None` when the timestamp is outside the representable range.
pub fn local_from_millis(epoch_ms: i64) -> Option<LocalTime> {
    market_offset().timestamp_millis_opt(epoch_ms).single()
}

/// Truncate to the start of the minute (seconds and sub-seconds dropped).
pub fn floor_minute(time: LocalTime) -> LocalTime {
    time.with_second(0)
        .and_then(|time| time.with_nanosecond(0))
        .unwrap_or(time)
}

/// Daily trading session window in market local time, both ends inclusive bucket starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    pub open: NaiveTime,
    pub last_bucket: NaiveTime,
}

impl Default for TradingSession {
    /// 09:15 to 15:29, the last one-minute bucket before the 15:30 close.
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            last_bucket: NaiveTime::from_hms_opt(15, 29, 0).unwrap_or_default(),
        }
    }
}

impl TradingSession {
    pub fn new(open: NaiveTime, last_bucket: NaiveTime) -> Self {
        Self { open, last_bucket }
    }

    /// Whether a bucket starting at `time` lies within the session window.
    pub fn contains(&self, time: &LocalTime) -> bool {
        let time = time.time();
        time >= self.open && time <= self.last_bucket
    }

    /// Truncate to the start of the `bucket_minutes` wide bucket containing `time`.
    ///
    /// Buckets are anchored to the session open, matching [`TradingSession::bucket_starts`].
    pub fn floor_bucket(&self, time: LocalTime, bucket_minutes: u32) -> LocalTime {
        let minute = floor_minute(time);
        if bucket_minutes <= 1 {
            return minute;
        }

        let Some(open) = market_offset()
            .from_local_datetime(&minute.date_naive().and_time(self.open))
            .single()
        else {
            return minute;
        };

        let width = i64::from(bucket_minutes);
        let elapsed = (minute - open).num_minutes();
        open + Duration::minutes(elapsed.div_euclid(width) * width)
    }

    /// Every bucket start of the session on `date`, stepping by `bucket_minutes`.
    pub fn bucket_starts(&self, date: NaiveDate, bucket_minutes: u32) -> Vec<LocalTime> {
        let offset = market_offset();
        let step = Duration::minutes(i64::from(bucket_minutes.max(1)));

        let (Some(start), Some(end)) = (
            offset.from_local_datetime(&date.and_time(self.open)).single(),
            offset
                .from_local_datetime(&date.and_time(self.last_bucket))
                .single(),
        ) else {
            return Vec::new();
        };

        std::iter::successors(Some(start), |current| Some(*current + step))
            .take_while(|current| *current <= end)
            .collect()
    }
}
