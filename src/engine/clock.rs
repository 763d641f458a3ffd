//! Engine Clock and ET Calendar
//!
//! All engine time is naive US Eastern Time (`NaiveDateTime`). The simulator
//! stores and reasons about timestamps in ET because decision windows, budget
//! resets, and trading-hours checks are all defined on the ET calendar.
//!
//! # Determinism Contract
//!
//! - Engine components never call system time; `now` is passed in by the
//!   driver (pull-based ticks) or read from an injected [`Clock`].
//! - [`SimClock`] only moves forward; backward movement is a bug.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};

/// Regular trading hours open (ET).
pub const RTH_OPEN: NaiveTime = match NaiveTime::from_hms_opt(9, 30, 0) {
    Some(t) => t,
    None => unreachable!(),
};

/// Regular trading hours close (ET).
pub const RTH_CLOSE: NaiveTime = match NaiveTime::from_hms_opt(16, 0, 0) {
    Some(t) => t,
    None => unreachable!(),
};

/// Source of "now" in engine time (naive ET).
pub trait Clock: Send + Sync {
    fn now_et(&self) -> NaiveDateTime;
}

/// Monotonic simulated clock for backtests.
///
/// `advance_to` only moves forward; the debug assertion catches drivers that
/// replay out-of-order timestamps.
#[derive(Debug, Clone)]
pub struct SimClock {
    current: NaiveDateTime,
}

impl SimClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { current: start }
    }

    #[inline]
    pub fn now(&self) -> NaiveDateTime {
        self.current
    }

    #[inline]
    pub fn advance_to(&mut self, new_time: NaiveDateTime) {
        debug_assert!(
            new_time >= self.current,
            "SimClock: cannot go backward from {} to {}",
            self.current,
            new_time
        );
        self.current = new_time;
    }

    #[inline]
    pub fn advance_by(&mut self, delta: Duration) {
        debug_assert!(delta >= Duration::zero(), "SimClock: delta must be non-negative");
        self.current += delta;
    }
}

impl Clock for SimClock {
    fn now_et(&self) -> NaiveDateTime {
        self.current
    }
}

/// Wall clock for live operation. Converts UTC to naive ET.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_et(&self) -> NaiveDateTime {
        utc_to_et(Utc::now())
    }
}

/// Convert a UTC instant to naive Eastern Time.
///
/// Applies the post-2007 US DST rule (second Sunday of March through first
/// Sunday of November, transitions at 02:00 local). The one-hour ambiguity
/// around the transitions is resolved by evaluating the rule on the
/// offset-adjusted date, which is exact for every hour the engine trades.
pub fn utc_to_et(utc: DateTime<Utc>) -> NaiveDateTime {
    let guess = utc.naive_utc() - Duration::hours(5);
    let offset = if is_eastern_dst(guess) { 4 } else { 5 };
    utc.naive_utc() - Duration::hours(offset)
}

/// Whether the given naive ET timestamp falls in the EDT (UTC-4) period.
pub fn is_eastern_dst(et: NaiveDateTime) -> bool {
    let year = et.year();
    let dst_start = nth_weekday(year, 3, Weekday::Sun, 2)
        .and_time(NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(RTH_OPEN));
    let dst_end = nth_weekday(year, 11, Weekday::Sun, 1)
        .and_time(NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(RTH_OPEN));
    et >= dst_start && et < dst_end
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, nth: u32) -> NaiveDate {
    let mut d = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default();
    let mut seen = 0;
    loop {
        if d.weekday() == weekday {
            seen += 1;
            if seen == nth {
                return d;
            }
        }
        d = d.succ_opt().unwrap_or(d);
    }
}

/// Whether `ts` falls inside regular trading hours (weekdays 09:30–16:00 ET).
pub fn is_rth(ts: NaiveDateTime) -> bool {
    let wd = ts.weekday();
    if wd == Weekday::Sat || wd == Weekday::Sun {
        return false;
    }
    let t = ts.time();
    t >= RTH_OPEN && t < RTH_CLOSE
}

/// Minutes elapsed between two timestamps (negative if `later` precedes `earlier`).
pub fn minutes_between(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    (later - earlier).num_seconds() as f64 / 60.0
}

/// Calendar month key used for monthly budget rollover.
#[inline]
pub fn month_key(ts: NaiveDateTime) -> (i32, u32) {
    (ts.year(), ts.month())
}
