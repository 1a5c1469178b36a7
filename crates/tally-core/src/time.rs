//! Clock abstraction and the single reporting time zone.
//!
//! Timestamps are always `DateTime<Utc>`. Calendar questions ("which day is
//! this rollup for?", "what counted as of that day?") are answered in one
//! fixed offset so that rollup boundaries never drift with local DST rules.

use chrono::{
  DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeDelta, TimeZone, Utc,
};

/// Source of the current instant.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// The fixed offset in which calendar dates are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingZone {
  offset: FixedOffset,
}

impl Default for ReportingZone {
  fn default() -> Self { Self::utc() }
}

impl ReportingZone {
  pub fn utc() -> Self {
    Self { offset: Utc.fix() }
  }

  /// Returns `None` if the offset is outside ±24h.
  pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
    FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
  }

  pub fn offset(&self) -> FixedOffset { self.offset }

  /// The calendar date `at` falls on in this zone.
  pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&self.offset).date_naive()
  }

  /// The first instant after `date` in this zone. Anything strictly before
  /// the cut-off counts as "as of" `date`.
  pub fn cutoff(&self, date: NaiveDate) -> DateTime<Utc> {
    let Some(next) = date.succ_opt() else {
      return DateTime::<Utc>::MAX_UTC;
    };
    let local_midnight = next.and_time(NaiveTime::MIN);
    let utc = local_midnight
      - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
  }
}
