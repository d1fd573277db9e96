use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Days considered for productivity windows and focus blocks.
pub const WORKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

pub const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Whole working hours `[start, end)` used for bucketing, e.g. 9..17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl Default for HourRange {
    fn default() -> Self {
        Self { start: 9, end: 17 }
    }
}

impl HourRange {
    pub fn new(start: u32, end: u32) -> EngineResult<Self> {
        if start >= end || end > 24 {
            return Err(EngineError::Configuration(format!(
                "working hours must satisfy start < end <= 24, got {}..{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn hours(&self) -> std::ops::Range<u32> {
        self.start..self.end
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        hour >= self.start && hour < self.end
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Parses full ("Friday") or short ("fri") day names, ignoring case.
pub fn parse_weekday(name: &str) -> Option<Weekday> {
    let name = name.trim();
    ALL_DAYS.iter().copied().find(|day| {
        let full = weekday_name(*day);
        full.eq_ignore_ascii_case(name) || full[..3].eq_ignore_ascii_case(name)
    })
}

/// Index of a day in Monday-first order, used for deterministic tie-breaks.
pub fn weekday_index(name: &str) -> usize {
    parse_weekday(name)
        .map(|day| day.num_days_from_monday() as usize)
        .unwrap_or(ALL_DAYS.len())
}

/// Hour bucket key, e.g. `"09:00"`.
pub fn hour_key(hour: u32) -> String {
    format!("{:02}:00", hour)
}

/// Combined bucket key, e.g. `"Monday-09:00"`.
pub fn day_hour_key(day: Weekday, hour: u32) -> String {
    format!("{}-{}", weekday_name(day), hour_key(hour))
}

pub fn format_hhmm(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Parses an `"HH:MM"` wall-clock time into minutes since midnight.
/// `"24:00"` is accepted as the end of the day.
pub fn parse_hhmm(value: &str) -> EngineResult<u32> {
    let invalid = || EngineError::Configuration(format!("invalid time '{}', expected HH:MM", value));

    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;

    if minutes > 59 || hours > 24 || (hours == 24 && minutes > 0) {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}

pub fn parse_timezone(name: &str) -> EngineResult<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::Configuration(format!("unknown timezone '{}'", name)))
}

pub fn to_local(instant: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    instant.with_timezone(&tz)
}

pub fn minute_of_day<T: Timelike>(time: &T) -> u32 {
    time.hour() * 60 + time.minute()
}

/// The instant at `minutes` past local midnight on `date`.
/// Returns `None` when that wall-clock time does not exist (DST gap).
pub fn local_instant(date: NaiveDate, minutes: u32, tz: Tz) -> Option<DateTime<Utc>> {
    if minutes >= 24 * 60 {
        return local_instant(date.succ_opt()?, minutes - 24 * 60, tz);
    }
    let time = NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)?;
    let local = tz.from_local_datetime(&date.and_time(time)).earliest()?;
    Some(local.with_timezone(&Utc))
}

/// Start and end of the local calendar day containing `instant`.
pub fn local_day_bounds(instant: DateTime<Utc>, tz: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let date = to_local(instant, tz).date_naive();
    let start = local_instant(date, 0, tz)?;
    let end = local_instant(date.succ_opt()?, 0, tz)?;
    Some((start, end))
}

/// Next instant strictly after `now` that falls on `day` at `minutes` local time.
pub fn next_occurrence(now: DateTime<Utc>, day: Weekday, minutes: u32, tz: Tz) -> Option<DateTime<Utc>> {
    let today = to_local(now, tz).date_naive();
    (0..=7)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .filter(|date| date.weekday() == day)
        .filter_map(|date| local_instant(date, minutes, tz))
        .find(|candidate| *candidate > now)
}

/// Half-open interval overlap.
pub fn ranges_overlap<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && a_end > b_start
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_hour_range_validation() {
        assert_eq!(HourRange::default().hours(), 9..17);
        assert!(HourRange::new(17, 9).is_err());
        assert!(HourRange::new(8, 25).is_err());
        let range = HourRange::new(8, 18).unwrap();
        assert!(range.contains_hour(8));
        assert!(!range.contains_hour(18));
    }

    #[test]
    fn test_parse_weekday_variants() {
        assert_eq!(parse_weekday("Friday"), Some(Weekday::Fri));
        assert_eq!(parse_weekday("friday"), Some(Weekday::Fri));
        assert_eq!(parse_weekday("FRI"), Some(Weekday::Fri));
        assert_eq!(parse_weekday(" monday "), Some(Weekday::Mon));
        assert_eq!(parse_weekday("someday"), None);
    }

    #[test]
    fn test_bucket_keys() {
        assert_eq!(hour_key(9), "09:00");
        assert_eq!(day_hour_key(Weekday::Wed, 14), "Wednesday-14:00");
        assert_eq!(format_hhmm(13 * 60 + 5), "13:05");
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("09:00").unwrap(), 540);
        assert_eq!(parse_hhmm("17:30").unwrap(), 1050);
        assert_eq!(parse_hhmm("24:00").unwrap(), 1440);
        assert!(parse_hhmm("9am").is_err());
        assert!(parse_hhmm("12:75").is_err());
        assert!(parse_hhmm("25:00").is_err());
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Europe/Berlin").unwrap(), chrono_tz::Europe::Berlin);
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_local_instant_respects_timezone() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let instant = local_instant(date, 9 * 60, chrono_tz::America::New_York).unwrap();
        assert_eq!(instant, utc("2025-01-15T14:00:00Z"));
    }

    #[test]
    fn test_local_day_bounds() {
        let (start, end) = local_day_bounds(utc("2025-01-15T14:00:00Z"), Tz::UTC).unwrap();
        assert_eq!(start, utc("2025-01-15T00:00:00Z"));
        assert_eq!(end, utc("2025-01-16T00:00:00Z"));
    }

    #[test]
    fn test_next_occurrence() {
        // Wednesday 2025-01-15 12:00 UTC
        let now = utc("2025-01-15T12:00:00Z");

        let later_today = next_occurrence(now, Weekday::Wed, 14 * 60, Tz::UTC).unwrap();
        assert_eq!(later_today, utc("2025-01-15T14:00:00Z"));

        let next_week = next_occurrence(now, Weekday::Wed, 9 * 60, Tz::UTC).unwrap();
        assert_eq!(next_week, utc("2025-01-22T09:00:00Z"));

        let friday = next_occurrence(now, Weekday::Fri, 10 * 60, Tz::UTC).unwrap();
        assert_eq!(friday, utc("2025-01-17T10:00:00Z"));
    }

    #[test]
    fn test_ranges_overlap_is_half_open() {
        assert!(ranges_overlap(0, 10, 5, 15));
        assert!(!ranges_overlap(0, 10, 10, 20));
        assert!(!ranges_overlap(10, 20, 0, 10));
    }
}
