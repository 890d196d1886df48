//! DOS packed date/time codec and the `SOURCE_DATE_EPOCH` reproducibility hook.
//!
//! A DOS date is `year_since_1980<<9 | month<<5 | day`, a DOS time is
//! `hour<<11 | minute<<5 | second/2` (two-second resolution). Both are
//! plain `u16`s on disk, packed next to each other in every directory
//! entry's creation/access/write fields.

use chrono::{Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

/// A decoded creation/write/access timestamp, always UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosTimestamp {
    pub date: u16,
    pub time: u16,
    /// Tenths of a second, only meaningful for the creation timestamp.
    pub time_tenth: u8,
}

const EPOCH_YEAR: i32 = 1980;
const MAX_YEAR: i32 = 1980 + 127; // 2107, per spec §4.5

impl DosTimestamp {
    pub fn from_unix_seconds(secs: i64) -> Self {
        let dt = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(|| {
            // Clamp to the DOS epoch if we somehow got handed something
            // before 1980 (e.g. a zeroed SOURCE_DATE_EPOCH).
            Utc.with_ymd_and_hms(EPOCH_YEAR, 1, 1, 0, 0, 0).unwrap()
        });
        Self::from_datetime(dt.naive_utc())
    }

    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        let year = dt.year().clamp(EPOCH_YEAR, MAX_YEAR);
        let date = (((year - EPOCH_YEAR) as u16) << 9) | ((dt.month() as u16) << 5) | (dt.day() as u16);
        let even_second = dt.second() & !1;
        let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | ((even_second / 2) as u16);
        let time_tenth = ((dt.second() % 2) * 100) as u8;
        Self {
            date,
            time,
            time_tenth,
        }
    }

    pub fn year(&self) -> i32 {
        EPOCH_YEAR + ((self.date >> 9) & 0x7F) as i32
    }

    pub fn month(&self) -> u32 {
        ((self.date >> 5) & 0x0F) as u32
    }

    pub fn day(&self) -> u32 {
        (self.date & 0x1F) as u32
    }

    pub fn hour(&self) -> u32 {
        ((self.time >> 11) & 0x1F) as u32
    }

    pub fn minute(&self) -> u32 {
        ((self.time >> 5) & 0x3F) as u32
    }

    pub fn second(&self) -> u32 {
        ((self.time & 0x1F) as u32) * 2 + (self.time_tenth / 100) as u32
    }
}

/// Source of "now" for newly-written directory entries.
///
/// Captured once at `Filesystem` construction (mount/format) rather than
/// re-read on every write, so a mutation to the process environment
/// mid-mount cannot change an in-flight session's timestamps (§9).
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    /// Use the wall clock at the moment each entry is written.
    Wall,
    /// Force every timestamp written during this session to a fixed epoch.
    Fixed(i64),
}

impl Clock {
    /// Resolve the clock a new `Filesystem` session should use: an
    /// explicit epoch override wins, otherwise the `SOURCE_DATE_EPOCH`
    /// environment variable if it parses, otherwise — only if
    /// `reproducible` was requested without a usable epoch from either
    /// source — a fixed fallback, otherwise the wall clock. The env var
    /// is consulted regardless of `reproducible`: a host that merely
    /// exports `SOURCE_DATE_EPOCH` gets forced timestamps too.
    pub fn resolve(reproducible: bool, explicit_epoch: Option<i64>) -> Self {
        if let Some(epoch) = explicit_epoch {
            return Clock::Fixed(epoch);
        }
        if let Ok(val) = std::env::var("SOURCE_DATE_EPOCH") {
            if let Ok(epoch) = val.parse::<i64>() {
                return Clock::Fixed(epoch);
            }
        }
        if reproducible {
            // `reproducible=true` without a usable SOURCE_DATE_EPOCH still
            // has to be deterministic across the two images the property
            // in §8 compares, so fall back to the DOS epoch itself.
            return Clock::Fixed(0);
        }
        Clock::Wall
    }

    pub fn now(&self) -> DosTimestamp {
        match self {
            Clock::Wall => DosTimestamp::from_datetime(Utc::now().naive_utc()),
            Clock::Fixed(epoch) => DosTimestamp::from_unix_seconds(*epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_epoch_roundtrip() {
        let ts = DosTimestamp::from_unix_seconds(1609459200); // 2021-01-01T00:00:00Z
        assert_eq!(ts.year(), 2021);
        assert_eq!(ts.month(), 1);
        assert_eq!(ts.day(), 1);
        assert_eq!(ts.hour(), 0);
        assert_eq!(ts.minute(), 0);
        assert_eq!(ts.second(), 0);
    }

    #[test]
    fn fixed_clock_is_stable_across_calls() {
        let clock = Clock::resolve(true, Some(1609459200));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, b);
    }

    #[test]
    fn source_date_epoch_forces_fixed_clock_without_reproducible_flag() {
        std::env::set_var("SOURCE_DATE_EPOCH", "1609459200");
        let clock = Clock::resolve(false, None);
        std::env::remove_var("SOURCE_DATE_EPOCH");
        assert!(matches!(clock, Clock::Fixed(1609459200)));
    }

    #[test]
    fn seconds_round_down_to_even() {
        let ts = DosTimestamp::from_unix_seconds(1609459201); // one odd second in
        assert_eq!(ts.second() % 2, 1); // tenths recover the odd second
        assert_eq!(ts.time & 0x1F, 0); // but the packed field itself is even
    }
}
