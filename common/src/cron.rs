use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// How far `next_after` searches before giving up. Covers every leap-year
/// combination, so anything unreachable within it (e.g. `0 0 30 2 *`) is
/// unreachable forever.
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day month weekday), found {0}")]
    FieldCount(usize),
    #[error("invalid value `{value}` in {field} field")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u8,
        max: u8,
    },
    #[error("{field} range {start}-{end} is inverted")]
    InvertedRange {
        field: &'static str,
        start: u8,
        end: u8,
    },
    #[error("step must be greater than zero in {field} field")]
    ZeroStep { field: &'static str },
}

/// One parsed field of a cron expression: either the wildcard `*` or a
/// non-empty set of accepted values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    wildcard: bool,
    values: BTreeSet<u8>,
}

impl Field {
    fn contains(&self, value: u8) -> bool {
        self.wildcard || self.values.contains(&value)
    }
}

/// A parsed 5-field cron schedule (minute, hour, day-of-month, month,
/// day-of-week), evaluated at one-minute granularity in UTC.
///
/// Day-of-week runs 0-6 with 0 = Sunday; 7 is accepted as an alias for
/// Sunday. When both day fields are restricted, a date matching either one
/// is accepted, per the standard cron special case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
    source: String,
}

impl CronExpression {
    /// Parse a 5-field cron expression. Supports `*`, single values, comma
    /// lists, ranges (`a-b`), and steps (`*/n`, `a-b/n`) on every field.
    /// An invalid expression is rejected whole; there is no partially-valid
    /// schedule.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::FieldCount(parts.len()));
        }

        let minute = parse_field(parts[0], "minute", 0, 59)?;
        let hour = parse_field(parts[1], "hour", 0, 23)?;
        let day_of_month = parse_field(parts[2], "day-of-month", 1, 31)?;
        let month = parse_field(parts[3], "month", 1, 12)?;
        let mut day_of_week = parse_field(parts[4], "day-of-week", 0, 7)?;
        // Fold 7 (alias for Sunday) onto 0 so evaluation only sees 0-6.
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(Self {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
            source: expr.trim().to_string(),
        })
    }

    /// The smallest timestamp strictly greater than `from` (seconds zeroed)
    /// that satisfies this expression, or `None` if nothing matches within
    /// the search horizon.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = from.naive_utc().with_second(0)?.with_nanosecond(0)?;
        t += Duration::minutes(1);
        let horizon = t + Duration::days(SEARCH_HORIZON_DAYS);

        while t < horizon {
            if !self.month.contains(t.month() as u8) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour() as u8) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute() as u8) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(DateTime::from_naive_utc_and_offset(t, Utc));
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day() as u8);
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday() as u8);

        match (self.day_of_month.wildcard, self.day_of_week.wildcard) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            // Both restricted: standard cron accepts a date matching either.
            (false, false) => dom || dow,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(spec: &str, field: &'static str, min: u8, max: u8) -> Result<Field, ScheduleError> {
    if spec == "*" {
        return Ok(Field {
            wildcard: true,
            values: BTreeSet::new(),
        });
    }

    let mut values = BTreeSet::new();
    for term in spec.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str.parse().map_err(|_| ScheduleError::InvalidValue {
                    field,
                    value: term.to_string(),
                })?;
                if step == 0 {
                    return Err(ScheduleError::ZeroStep { field });
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, field, min, max)?,
                parse_value(b, field, min, max)?,
            )
        } else {
            let v = parse_value(range, field, min, max)?;
            // `n/step` extends from n to the top of the field's range.
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if start > end {
            return Err(ScheduleError::InvertedRange { field, start, end });
        }

        let mut v = start as u32;
        while v <= end as u32 {
            values.insert(v as u8);
            v += step;
        }
    }

    // Unreachable in practice: every accepted term inserts at least one
    // value, but keep the invariant explicit.
    if values.is_empty() {
        return Err(ScheduleError::InvalidValue {
            field,
            value: spec.to_string(),
        });
    }

    Ok(Field {
        wildcard: false,
        values,
    })
}

fn parse_value(s: &str, field: &'static str, min: u8, max: u8) -> Result<u8, ScheduleError> {
    let v: u32 = s.parse().map_err(|_| ScheduleError::InvalidValue {
        field,
        value: s.to_string(),
    })?;
    if v < min as u32 || v > max as u32 {
        return Err(ScheduleError::OutOfRange {
            field,
            value: v,
            min,
            max,
        });
    }
    Ok(v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn midnight_daily_from_evening() {
        let expr = CronExpression::parse("0 0 * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 1, 23, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 2, 0, 0));
    }

    #[test]
    fn minute_step_from_offset() {
        let expr = CronExpression::parse("*/6 * * * *").unwrap();
        let next = expr.next_after(utc(2024, 3, 5, 10, 7)).unwrap();
        assert_eq!(next, utc(2024, 3, 5, 10, 12));
    }

    #[test]
    fn next_is_strictly_greater_even_on_exact_match() {
        // 10:12 itself matches */6; the next firing must still be later.
        let expr = CronExpression::parse("*/6 * * * *").unwrap();
        let next = expr.next_after(utc(2024, 3, 5, 10, 12)).unwrap();
        assert_eq!(next, utc(2024, 3, 5, 10, 18));
    }

    #[test]
    fn every_six_hours() {
        let expr = CronExpression::parse("0 */6 * * *").unwrap();
        let next = expr.next_after(utc(2024, 3, 5, 7, 30)).unwrap();
        assert_eq!(next, utc(2024, 3, 5, 12, 0));
    }

    #[test]
    fn ranges_and_lists() {
        let expr = CronExpression::parse("15,45 9-17 * * 1-5").unwrap();
        // Friday 17:45 -> Monday 09:15 (skips the weekend).
        let next = expr.next_after(utc(2024, 1, 5, 17, 45)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 9, 15));
    }

    #[test]
    fn dom_dow_or_semantics() {
        // Day 13 of the month OR a Friday, whichever comes first.
        let expr = CronExpression::parse("0 0 13 * 5").unwrap();
        // From Tuesday the 10th, the first match is Friday the 13th,
        // where both legs happen to coincide.
        let next = expr.next_after(utc(2024, 9, 10, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 9, 13, 0, 0));
        // From the 13th itself: the next Friday (the 20th) matches via the
        // day-of-week leg even though it is not the 13th.
        let next = expr.next_after(utc(2024, 9, 13, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 9, 20, 0, 0));
    }

    #[test]
    fn restricted_dom_with_wildcard_dow() {
        let expr = CronExpression::parse("0 12 1 * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 2, 1, 12, 0));
    }

    #[test]
    fn sunday_as_seven() {
        let a = CronExpression::parse("0 8 * * 0").unwrap();
        let b = CronExpression::parse("0 8 * * 7").unwrap();
        let from = utc(2024, 6, 1, 0, 0);
        assert_eq!(a.next_after(from), b.next_after(from));
        // 2024-06-02 is a Sunday.
        assert_eq!(a.next_after(from).unwrap(), utc(2024, 6, 2, 8, 0));
    }

    #[test]
    fn month_rollover() {
        let expr = CronExpression::parse("30 6 * 2 *").unwrap();
        let next = expr.next_after(utc(2024, 11, 20, 0, 0)).unwrap();
        assert_eq!(next, utc(2025, 2, 1, 6, 30));
    }

    #[test]
    fn impossible_date_returns_none() {
        let expr = CronExpression::parse("0 0 30 2 *").unwrap();
        assert_eq!(expr.next_after(utc(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn leap_day() {
        let expr = CronExpression::parse("0 0 29 2 *").unwrap();
        let next = expr.next_after(utc(2023, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 2, 29, 0, 0));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            CronExpression::parse("* * * *"),
            Err(ScheduleError::FieldCount(4))
        );
        assert!(CronExpression::parse("").is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            CronExpression::parse("60 * * * *"),
            Err(ScheduleError::OutOfRange { field: "minute", .. })
        ));
        assert!(matches!(
            CronExpression::parse("* 24 * * *"),
            Err(ScheduleError::OutOfRange { field: "hour", .. })
        ));
        assert!(matches!(
            CronExpression::parse("* * 0 * *"),
            Err(ScheduleError::OutOfRange { field: "day-of-month", .. })
        ));
    }

    #[test]
    fn rejects_garbage_and_bad_steps() {
        assert!(CronExpression::parse("every minute please").is_err());
        assert!(matches!(
            CronExpression::parse("*/0 * * * *"),
            Err(ScheduleError::ZeroStep { field: "minute" })
        ));
        assert!(matches!(
            CronExpression::parse("* * * * 5-1"),
            Err(ScheduleError::InvertedRange { .. })
        ));
    }

    #[test]
    fn display_round_trips_source() {
        let expr = CronExpression::parse("*/5 2 * * 1").unwrap();
        assert_eq!(expr.to_string(), "*/5 2 * * 1");
    }
}
