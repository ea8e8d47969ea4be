//! Classic 5-field cron evaluation with IANA timezone support.
//!
//! Expressions are parsed eagerly (at schedule create/update time) into
//! per-field bitsets; evaluation walks candidate civil times in the
//! schedule's timezone and resolves each to an absolute UTC instant, so a
//! DST gap can never stall the search and a DST fold always picks the
//! earliest mapping.

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Days, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CronError;

/// Search horizon in days (a leap cycle). An expression that cannot fire
/// within this window is treated as never firing.
const SEARCH_HORIZON_DAYS: u64 = 4 * 366;

/// A parsed `minute hour day-of-month month day-of-week` expression.
///
/// Field syntax: `*`, a number, a range `A-B`, a step `*/N` or `A-B/N`,
/// or a comma-separated list of the above. Day-of-week 0 and 7 both mean
/// Sunday. When day-of-month and day-of-week are both restricted, a date
/// matching either fires (conventional cron OR rule).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl std::str::FromStr for CronExpr {
    type Err = CronError;

    fn from_str(expr: &str) -> Result<Self, CronError> {
        Self::parse(expr)
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidCronExpression {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            )));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59).map_err(&invalid)?;
        let (hours, _) = parse_field(fields[1], 0, 23).map_err(&invalid)?;
        let (dom, dom_restricted) = parse_field(fields[2], 1, 31).map_err(&invalid)?;
        let (months, _) = parse_field(fields[3], 1, 12).map_err(&invalid)?;
        // Day-of-week allows 0-7; 7 folds onto Sunday (bit 0).
        let (dow_raw, dow_restricted) = parse_field(fields[4], 0, 7).map_err(&invalid)?;
        let dow = (dow_raw & 0x7f) | ((dow_raw >> 7) & 1);

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: dom as u32,
            months: months as u16,
            days_of_week: dow as u8,
            dom_restricted,
            dow_restricted,
        })
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.minutes & (1 << minute) != 0
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.hours & (1 << hour) != 0
    }

    fn date_matches(&self, date: chrono::NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom_match = self.days_of_month & (1 << date.day()) != 0;
        let dow_match = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            // Both restricted: fire on either (classic cron OR rule).
            (true, true) => dom_match || dow_match,
            _ => dom_match && dow_match,
        }
    }

    /// Earliest instant strictly after `after` that matches this expression
    /// in timezone `tz`, as a UTC instant. `None` when nothing matches
    /// within the search horizon (e.g. `0 0 30 2 *`).
    pub fn next_fire(&self, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // First candidate is the next whole minute after `after`.
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .map(|t| t + Duration::minutes(1))?;
        let start_local = start.with_timezone(&tz).naive_local();
        let start_date = start_local.date();

        for day_offset in 0..SEARCH_HORIZON_DAYS {
            let date = start_date.checked_add_days(Days::new(day_offset))?;
            if !self.date_matches(date) {
                continue;
            }
            let first_day = day_offset == 0;
            for hour in 0..24u32 {
                if first_day && hour < start_local.hour() {
                    continue;
                }
                if !self.hour_matches(hour) {
                    continue;
                }
                for minute in 0..60u32 {
                    if first_day && hour == start_local.hour() && minute < start_local.minute() {
                        continue;
                    }
                    if !self.minute_matches(minute) {
                        continue;
                    }
                    let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    let resolved = match tz.from_local_datetime(&naive) {
                        LocalResult::Single(t) => t,
                        // DST fold: the civil time occurs twice, fire at the
                        // earlier absolute instant.
                        LocalResult::Ambiguous(earliest, _) => earliest,
                        // DST gap: this civil time never exists, skip it.
                        LocalResult::None => continue,
                    };
                    let utc = resolved.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
            }
        }
        None
    }
}

/// Parse one field into a bitset over `[min, max]`. Returns the mask and
/// whether the field is restricted (anything other than a bare `*`).
fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool), String> {
    if field == "*" {
        return Ok((mask_range(min, max), false));
    }

    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in '{field}'"));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in '{field}'"))?;
                if step == 0 {
                    return Err(format!("step must be >= 1 in '{field}'"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, min, max, field)?;
            let hi = parse_value(b, min, max, field)?;
            if lo > hi {
                return Err(format!("descending range '{range}' in '{field}'"));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, min, max, field)?;
            if step != 1 {
                return Err(format!("step requires '*' or a range in '{field}'"));
            }
            (v, v)
        };

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok((mask, true))
}

fn parse_value(s: &str, min: u32, max: u32, field: &str) -> Result<u32, String> {
    let v: u32 = s
        .parse()
        .map_err(|_| format!("invalid value '{s}' in '{field}'"))?;
    if v < min || v > max {
        return Err(format!("value {v} out of range {min}-{max} in '{field}'"));
    }
    Ok(v)
}

fn mask_range(min: u32, max: u32) -> u64 {
    let mut mask = 0u64;
    for v in min..=max {
        mask |= 1 << v;
    }
    mask
}

/// Parse, resolve the timezone, and compute the next fire instant in one
/// call. This is the evaluator entry point the coordinator and the admin
/// client use.
pub fn next_fire_time(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let parsed = CronExpr::parse(expr)?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| CronError::InvalidTimezone {
            tz: timezone.to_string(),
        })?;
    parsed
        .next_fire(tz, after)
        .ok_or_else(|| CronError::InvalidCronExpression {
            expr: expr.to_string(),
            reason: "expression never fires within the search horizon".to_string(),
        })
}

/// Validate an expression and timezone pair without computing anything.
pub fn validate(expr: &str, timezone: &str) -> Result<(), CronError> {
    CronExpr::parse(expr)?;
    timezone
        .parse::<Tz>()
        .map(|_| ())
        .map_err(|_| CronError::InvalidTimezone {
            tz: timezone.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn next(expr: &str, tz: &str, after: &str) -> DateTime<Utc> {
        next_fire_time(expr, tz, utc(after)).unwrap()
    }

    #[test]
    fn daily_nine_after_ten_fires_tomorrow() {
        assert_eq!(
            next("0 9 * * *", "UTC", "2026-02-05T10:00:00Z"),
            utc("2026-02-06T09:00:00Z")
        );
    }

    #[test]
    fn daily_nine_after_eight_fires_today() {
        assert_eq!(
            next("0 9 * * *", "UTC", "2026-02-05T08:00:00Z"),
            utc("2026-02-05T09:00:00Z")
        );
    }

    #[test]
    fn fire_is_strictly_after_reference() {
        // Reference instant exactly on a fire slot: that slot is consumed,
        // the next one is returned.
        assert_eq!(
            next("0 9 * * *", "UTC", "2026-02-05T09:00:00Z"),
            utc("2026-02-06T09:00:00Z")
        );
    }

    #[test]
    fn every_fifteen_minutes() {
        assert_eq!(
            next("*/15 * * * *", "UTC", "2026-02-05T10:07:00Z"),
            utc("2026-02-05T10:15:00Z")
        );
        assert_eq!(
            next("*/15 * * * *", "UTC", "2026-02-05T10:59:30Z"),
            utc("2026-02-05T11:00:00Z")
        );
    }

    #[test]
    fn weekdays_skip_weekend() {
        // 2026-02-06 is a Friday; the next weekday 09:00 after Friday 10:00
        // is Monday 2026-02-09.
        assert_eq!(
            next("0 9 * * 1-5", "UTC", "2026-02-06T10:00:00Z"),
            utc("2026-02-09T09:00:00Z")
        );
    }

    #[test]
    fn comma_list_and_range_step() {
        assert_eq!(
            next("5,35 8-10/2 * * *", "UTC", "2026-02-05T08:40:00Z"),
            utc("2026-02-05T10:05:00Z")
        );
    }

    #[test]
    fn dow_seven_is_sunday() {
        let via_seven = next("0 0 * * 7", "UTC", "2026-02-05T00:00:00Z");
        let via_zero = next("0 0 * * 0", "UTC", "2026-02-05T00:00:00Z");
        assert_eq!(via_seven, via_zero);
        // 2026-02-08 is a Sunday.
        assert_eq!(via_zero, utc("2026-02-08T00:00:00Z"));
    }

    #[test]
    fn dom_and_dow_are_or_combined_when_both_restricted() {
        // "midnight on the 13th or on Fridays": 2026-02-06 is a Friday and
        // comes before the 13th, so the dow leg fires first.
        assert_eq!(
            next("0 0 13 * 5", "UTC", "2026-02-05T01:00:00Z"),
            utc("2026-02-06T00:00:00Z")
        );
        // With only dom restricted, Fridays are not special.
        assert_eq!(
            next("0 0 13 * *", "UTC", "2026-02-05T01:00:00Z"),
            utc("2026-02-13T00:00:00Z")
        );
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // America/New_York 2026: clocks jump 02:00 -> 03:00 on March 8, so
        // 02:30 local does not exist that day. The next real 02:30 is on
        // March 9 (EDT, UTC-4).
        assert_eq!(
            next("30 2 * * *", "America/New_York", "2026-03-08T06:00:00Z"),
            utc("2026-03-09T06:30:00Z")
        );
    }

    #[test]
    fn fall_back_fold_resolves_to_earliest_instant() {
        // America/New_York 2026: clocks fall back 02:00 -> 01:00 on Nov 1,
        // so 01:30 local occurs twice (05:30Z in EDT, 06:30Z in EST). The
        // earliest absolute mapping wins.
        assert_eq!(
            next("30 1 * * *", "America/New_York", "2026-11-01T04:00:00Z"),
            utc("2026-11-01T05:30:00Z")
        );
    }

    #[test]
    fn timezone_offset_is_applied() {
        // 09:00 in Berlin (CET, UTC+1) is 08:00 UTC in February.
        assert_eq!(
            next("0 9 * * *", "Europe/Berlin", "2026-02-05T00:00:00Z"),
            utc("2026-02-05T08:00:00Z")
        );
    }

    #[test]
    fn unsatisfiable_expression_errors() {
        // February 30th never exists.
        let err = next_fire_time("0 0 30 2 *", "UTC", utc("2026-01-01T00:00:00Z"));
        assert!(err.is_err());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "5/2 * * * *",
        ] {
            assert!(
                CronExpr::parse(expr).is_err(),
                "expected parse failure for '{expr}'"
            );
        }
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let err = next_fire_time("0 9 * * *", "Mars/Olympus", utc("2026-02-05T00:00:00Z"));
        assert!(matches!(err, Err(CronError::InvalidTimezone { .. })));
    }

    #[test]
    fn validate_accepts_good_and_rejects_bad() {
        assert!(validate("0 9 * * 1-5", "Europe/Berlin").is_ok());
        assert!(validate("0 9 * * 1-5", "Nowhere").is_err());
        assert!(validate("not-a-cron", "UTC").is_err());
    }
}
