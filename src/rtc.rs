//! Conversions between civil time and the device RTC tuple.
//!
//! MicroPython's `rtc.datetime()` speaks 8-tuples
//! `(year, month, day, weekday, hour, minute, second, subsecond)` with
//! weekday 0 = Monday. The subsecond slot is always written as 0.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

static RTC_TUPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+)\s*\)$")
        .unwrap()
});

/// An RTC tuple as understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rp2Datetime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    /// 0 = Monday … 6 = Sunday.
    pub weekday: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Convert a civil timestamp into the device tuple, truncating to seconds.
pub fn date_to_rp2_datetime(dt: &NaiveDateTime) -> Rp2Datetime {
    Rp2Datetime {
        year: dt.year(),
        month: dt.month(),
        day: dt.day(),
        weekday: dt.weekday().num_days_from_monday(),
        hour: dt.hour(),
        minute: dt.minute(),
        second: dt.second(),
    }
}

/// Render a tuple as `YYYY-MM-DD HH:MM:SS`, the same shape
/// `NaiveDateTime` formats to at second precision.
pub fn rp2_datetime_to_string(t: &Rp2Datetime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    )
}

/// Render the tuple in device syntax, `(y, m, d, wd, h, m, s, 0)`.
pub fn rp2_datetime_to_tuple_string(t: &Rp2Datetime) -> String {
    format!(
        "({}, {}, {}, {}, {}, {}, {}, 0)",
        t.year, t.month, t.day, t.weekday, t.hour, t.minute, t.second
    )
}

/// Parse a device RTC tuple into a civil timestamp. The weekday slot is
/// redundant and ignored; invalid calendar values yield `None`.
pub fn parse_rp2_datetime(text: &str) -> Option<NaiveDateTime> {
    let caps = RTC_TUPLE.captures(text.trim())?;
    let field = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());
    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)?;
    date.and_hms_opt(field(5)?, field(6)?, field(7)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn civil(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn round_trips_to_second_precision() {
        for dt in [
            civil(2024, 1, 1, 0, 0, 0),
            civil(2024, 2, 29, 23, 59, 59),
            civil(2026, 8, 2, 14, 33, 7),
            civil(1999, 12, 31, 12, 0, 30),
        ] {
            let tuple = date_to_rp2_datetime(&dt);
            assert_eq!(
                rp2_datetime_to_string(&tuple),
                dt.format("%Y-%m-%d %H:%M:%S").to_string()
            );
        }
    }

    #[test]
    fn weekday_is_monday_based() {
        // 2024-01-01 was a Monday.
        let tuple = date_to_rp2_datetime(&civil(2024, 1, 1, 8, 0, 0));
        assert_eq!(tuple.weekday, 0);
        // 2024-01-07 was a Sunday.
        let tuple = date_to_rp2_datetime(&civil(2024, 1, 7, 8, 0, 0));
        assert_eq!(tuple.weekday, 6);
    }

    #[test]
    fn parses_device_output() {
        let parsed = parse_rp2_datetime("(2024, 3, 15, 4, 9, 30, 12, 0)").unwrap();
        assert_eq!(parsed, civil(2024, 3, 15, 9, 30, 12));
    }

    #[test]
    fn rejects_garbage_and_invalid_dates() {
        assert!(parse_rp2_datetime("not a tuple").is_none());
        assert!(parse_rp2_datetime("(2024, 13, 40, 0, 0, 0, 0, 0)").is_none());
        assert!(parse_rp2_datetime("(2024, 3, 15, 4, 9, 30)").is_none());
    }

    #[test]
    fn tuple_string_matches_device_syntax() {
        let tuple = date_to_rp2_datetime(&civil(2024, 3, 15, 9, 30, 12));
        assert_eq!(
            rp2_datetime_to_tuple_string(&tuple),
            "(2024, 3, 15, 4, 9, 30, 12, 0)"
        );
    }
}
