//! Cron expressions (5-field: min hour dom month dow).
//!
//! An expression is parsed once into a [`CronExpr`] holding one sorted
//! value set per field; evaluation never re-tokenizes the string. Values
//! are range-checked at parse time, and a day-of-week `7` is accepted as an
//! alias for Sunday (`0`), matching common crontabs.
//!
//! Next-fire search walks calendar days in the job's timezone and, on a
//! matching date, picks the earliest allowed `(hour, minute)`:
//! - Spring-forward gaps: a local time that doesn't exist is skipped in
//!   favor of the next allowed time.
//! - Fall-back overlaps: the earliest (pre-transition) mapping is chosen.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Days scanned before giving up. Eight years covers sparse dates like
/// `0 0 29 2 *` across leap cycles.
const DAY_SEARCH_LIMIT: u32 = 8 * 366;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Field sets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The allowed values of one field, expanded and sorted at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet {
    values: Vec<u32>,
}

impl FieldSet {
    /// Parse one field against its inclusive bounds. Supported parts,
    /// comma-separated: `*`, `a`, `a-b`, with an optional `/step` on `*`
    /// and `a-b`. `normalize` maps aliases after expansion, so both a bare
    /// dow `7` and a range like `5-7` resolve Sunday to `0`.
    fn parse(
        raw: &str,
        lo: u32,
        hi: u32,
        normalize: fn(u32) -> u32,
    ) -> Result<Self, String> {
        let mut values = Vec::new();
        for part in raw.split(',') {
            let (span, step) = match part.split_once('/') {
                Some((span, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("bad step in '{part}'"))?;
                    if step == 0 {
                        return Err(format!("zero step in '{part}'"));
                    }
                    (span, step)
                }
                None => (part, 1),
            };

            let (start, end) = if span == "*" {
                (lo, hi)
            } else if let Some((a, b)) = span.split_once('-') {
                let a: u32 = a.parse().map_err(|_| format!("bad range in '{part}'"))?;
                let b: u32 = b.parse().map_err(|_| format!("bad range in '{part}'"))?;
                (a, b)
            } else {
                let v: u32 = span.parse().map_err(|_| format!("bad value '{part}'"))?;
                (v, v)
            };

            if start < lo || end > hi || start > end {
                return Err(format!("'{part}' outside {lo}-{hi}"));
            }
            values.extend((start..=end).step_by(step as usize).map(normalize));
        }
        values.sort_unstable();
        values.dedup();
        if values.is_empty() {
            return Err("empty field".into());
        }
        Ok(Self { values })
    }

    fn contains(&self, value: u32) -> bool {
        self.values.binary_search(&value).is_ok()
    }

    fn first(&self) -> u32 {
        self.values[0]
    }

    /// Smallest allowed value `>= floor`, if any.
    fn at_or_after(&self, floor: u32) -> Option<u32> {
        match self.values.binary_search(&floor) {
            Ok(_) => Some(floor),
            Err(idx) => self.values.get(idx).copied(),
        }
    }
}

fn identity(v: u32) -> u32 {
    v
}

fn sunday_alias(v: u32) -> u32 {
    if v == 7 {
        0
    } else {
        v
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CronExpr
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!("expected 5 fields, got {}", fields.len()));
        }
        let field = |i: usize, name: &str, lo: u32, hi: u32, normalize: fn(u32) -> u32| {
            FieldSet::parse(fields[i], lo, hi, normalize)
                .map_err(|e| format!("{name} field: {e}"))
        };
        Ok(Self {
            minutes: field(0, "minute", 0, 59, identity)?,
            hours: field(1, "hour", 0, 23, identity)?,
            days_of_month: field(2, "day-of-month", 1, 31, identity)?,
            months: field(3, "month", 1, 12, identity)?,
            days_of_week: field(4, "day-of-week", 0, 7, sunday_alias)?,
        })
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.months.contains(date.month())
            && self.days_of_month.contains(date.day())
            && self
                .days_of_week
                .contains(date.weekday().num_days_from_sunday())
    }

    /// Earliest allowed `(hour, minute)` at or after `floor`; `None` floor
    /// means the first time of the day.
    fn time_at_or_after(&self, floor: Option<(u32, u32)>) -> Option<(u32, u32)> {
        let Some((floor_hour, floor_minute)) = floor else {
            return Some((self.hours.first(), self.minutes.first()));
        };
        let hour = self.hours.at_or_after(floor_hour)?;
        if hour == floor_hour {
            if let Some(minute) = self.minutes.at_or_after(floor_minute) {
                return Some((hour, minute));
            }
            // Minutes exhausted for this hour; roll to the next one.
            if let Some(next_hour) = self.hours.at_or_after(floor_hour + 1) {
                return Some((next_hour, self.minutes.first()));
            }
            return None;
        }
        Some((hour, self.minutes.first()))
    }

    /// Next occurrence strictly after `after`, evaluated in `tz`. Returns
    /// a UTC instant.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        // The first candidate is the next whole minute.
        let start = local_after + chrono::Duration::seconds(60 - local_after.second() as i64);
        let mut date = start.date();
        // Only the starting day carries a time floor.
        let mut day_floor = Some((start.hour(), start.minute()));

        for _ in 0..DAY_SEARCH_LIMIT {
            if self.date_matches(date) {
                let mut floor = day_floor;
                while let Some((hour, minute)) = self.time_at_or_after(floor) {
                    let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                        break;
                    };
                    match tz.from_local_datetime(&naive) {
                        chrono::LocalResult::Single(dt) => {
                            return Some(dt.with_timezone(&Utc));
                        }
                        chrono::LocalResult::Ambiguous(earliest, _) => {
                            return Some(earliest.with_timezone(&Utc));
                        }
                        // DST gap: this local time doesn't exist; try the
                        // next allowed time on the same day.
                        chrono::LocalResult::None => {
                            floor = if minute < 59 {
                                Some((hour, minute + 1))
                            } else if hour < 23 {
                                Some((hour + 1, 0))
                            } else {
                                break;
                            };
                        }
                    }
                }
            }
            date = date.succ_opt()?;
            day_floor = None;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_accepts_common_forms() {
        assert!(CronExpr::parse("* * * * *").is_ok());
        assert!(CronExpr::parse("0 9 * * 1-5").is_ok());
        assert!(CronExpr::parse("*/15 0,12 1 */2 *").is_ok());
        assert!(CronExpr::parse("30 4 1-15/2 * *").is_ok());
    }

    #[test]
    fn parse_rejects_malformed_and_out_of_range() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("a b c d e").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 8").is_err());
        assert!(CronExpr::parse("* * * * 5-2").is_err());
    }

    #[test]
    fn step_is_anchored_at_the_range_start() {
        let expr = CronExpr::parse("0 0 */10 * *").unwrap();
        // Day-of-month runs 1-31, so */10 yields 1, 11, 21, 31.
        assert_eq!(expr.days_of_month.values, vec![1, 11, 21, 31]);
    }

    #[test]
    fn dow_ranges_through_seven_fold_to_sunday() {
        // Fri-Sun written crontab-style as 5-7.
        let expr = CronExpr::parse("0 8 * * 5-7").unwrap();
        assert_eq!(expr.days_of_week.values, vec![0, 5, 6]);
    }

    #[test]
    fn next_simple_hourly() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let next = expr.next_after(&after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn next_is_strictly_after() {
        let expr = CronExpr::parse("0 11 * * *").unwrap();
        let exactly = Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap();
        let next = expr.next_after(&exactly, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 16, 11, 0, 0).unwrap());
    }

    #[test]
    fn next_daily_in_timezone() {
        // 09:00 in Paris is 07:00 UTC in summer.
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 6, 0, 0).unwrap();
        let next = expr.next_after(&after, parse_tz("Europe/Paris")).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 15, 7, 0, 0).unwrap());
    }

    #[test]
    fn sunday_matches_both_zero_and_seven() {
        // 2024-06-16 is a Sunday.
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 6, 16, 8, 0, 0).unwrap();

        let zero = CronExpr::parse("0 8 * * 0").unwrap();
        assert_eq!(zero.next_after(&after, chrono_tz::UTC), Some(sunday));

        let seven = CronExpr::parse("0 8 * * 7").unwrap();
        assert_eq!(seven.next_after(&after, chrono_tz::UTC), Some(sunday));

        let weekend = CronExpr::parse("0 8 * * 6,7").unwrap();
        // Saturday the 15th at 08:00 has passed; the 16th matches via 7→0.
        assert_eq!(weekend.next_after(&after, chrono_tz::UTC), Some(sunday));
    }

    #[test]
    fn dst_gap_is_skipped() {
        // Europe/Paris springs forward 2024-03-31: 02:00→03:00 local does
        // not exist. A 02:30 job lands on the next day's occurrence.
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        let tz = parse_tz("Europe/Paris");
        let after = Utc.with_ymd_and_hms(2024, 3, 30, 23, 0, 0).unwrap();
        let next = expr.next_after(&after, tz).unwrap();
        let local = next.with_timezone(&tz);
        assert_eq!(
            (local.month(), local.day(), local.hour(), local.minute()),
            (4, 1, 2, 30)
        );
    }

    #[test]
    fn dst_gap_falls_through_to_next_allowed_time_same_day() {
        // With both 02:30 and 03:30 allowed, the gapped 02:30 falls through
        // to 03:30 on the transition day itself.
        let expr = CronExpr::parse("30 2,3 * * *").unwrap();
        let tz = parse_tz("Europe/Paris");
        let after = Utc.with_ymd_and_hms(2024, 3, 30, 23, 0, 0).unwrap();
        let next = expr.next_after(&after, tz).unwrap();
        let local = next.with_timezone(&tz);
        assert_eq!(
            (local.month(), local.day(), local.hour(), local.minute()),
            (3, 31, 3, 30)
        );
    }

    #[test]
    fn sparse_dates_are_found_across_years() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let next = expr.next_after(&after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2028, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn unknown_tz_falls_back_to_utc() {
        assert_eq!(parse_tz("Not/AZone"), chrono_tz::UTC);
    }
}
