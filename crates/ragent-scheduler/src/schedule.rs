//! Cron schedule parsing and next-fire computation.
//!
//! Accepted forms:
//!
//! | Form                         | Example                 |
//! |------------------------------|-------------------------|
//! | five fields (min … dow)      | `*/5 * * * *`           |
//! | six fields (leading seconds) | `30 0 9 * * mon-fri`    |
//! | alias                        | `@daily`, `@hourly`, …  |
//! | empty                        | one-shot, never fires   |
//!
//! Each field takes `*`, lists (`,`), ranges (`-`) and steps (`/`); months
//! and weekdays also take three-letter names, and weekday `7` is Sunday.
//! When both day-of-month and day-of-week are restricted a day matches if
//! *either* matches, as in classic cron.
//!
//! Fields are normalised to explicit value lists here and the calendar walk
//! is done by the `cron` crate. Everything in this module is pure.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, SchedulerError};

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
/// Weekday spellings understood by the `cron` crate, indexed Sunday = 0.
const CRON_WEEKDAYS: &[&str] = &["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names for `min`, `min + 1`, …
    names: &'static [&'static str],
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[] };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES };
// 7 is accepted and folded onto Sunday.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: WEEKDAY_NAMES };

/// One parsed field: the matching values and whether it was written with a
/// leading `*` (which makes day-of-month / day-of-week unrestricted for the
/// union rule, even with a step).
#[derive(Debug, Clone)]
struct Field {
    values: BTreeSet<u32>,
    star: bool,
}

impl Field {
    fn render(&self, spec: &FieldSpec) -> String {
        if self.values.len() as u32 == spec.max - spec.min + 1 {
            return "*".to_string();
        }
        join(self.values.iter().map(u32::to_string))
    }
}

/// A parsed, non-empty cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    /// One schedule, or two when day-of-month and day-of-week are unioned.
    schedules: Vec<cron::Schedule>,
}

impl CronExpr {
    /// Parse `expr`. Returns `Ok(None)` for the empty (one-shot) expression.
    pub fn parse(expr: &str) -> Result<Option<Self>> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let expanded = expand_alias(trimmed)?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest) = match fields.len() {
            5 => (None, &fields[..]),
            6 => (
                Some(parse_field(fields[0], &SECOND).map_err(|e| invalid(trimmed, e))?),
                &fields[1..],
            ),
            n => {
                return Err(invalid(
                    trimmed,
                    format!("expected 5 or 6 fields, found {n}"),
                ))
            }
        };
        let minute = parse_field(rest[0], &MINUTE).map_err(|e| invalid(trimmed, e))?;
        let hour = parse_field(rest[1], &HOUR).map_err(|e| invalid(trimmed, e))?;
        let dom = parse_field(rest[2], &DAY_OF_MONTH).map_err(|e| invalid(trimmed, e))?;
        let month = parse_field(rest[3], &MONTH).map_err(|e| invalid(trimmed, e))?;
        let mut dow = parse_field(rest[4], &DAY_OF_WEEK).map_err(|e| invalid(trimmed, e))?;
        if dow.values.remove(&7) {
            dow.values.insert(0);
        }

        let second = second
            .map(|s| s.render(&SECOND))
            .unwrap_or_else(|| "0".to_string());
        let head = format!(
            "{second} {} {} ",
            minute.render(&MINUTE),
            hour.render(&HOUR)
        );
        let month = month.render(&MONTH);
        let dom_text = dom.render(&DAY_OF_MONTH);
        let dow_text = render_weekdays(&dow);

        let sources = if !dom.star && !dow.star {
            vec![
                format!("{head}{dom_text} {month} *"),
                format!("{head}* {month} {dow_text}"),
            ]
        } else {
            vec![format!("{head}{dom_text} {month} {dow_text}")]
        };

        let schedules = sources
            .iter()
            .map(|s| cron::Schedule::from_str(s).map_err(|e| invalid(trimmed, e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let parsed = Self {
            source: trimmed.to_string(),
            schedules,
        };

        // Syntactically fine but impossible, e.g. February 30th.
        let probe = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        if probe.and_then(|p| parsed.next_after(&p)).is_none() {
            return Err(invalid(trimmed, "expression never fires"));
        }

        Ok(Some(parsed))
    }

    /// The expression as written (trimmed).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First fire strictly after `after`, evaluated in `after`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(after).next())
            .min()
    }
}

/// Check `expr` without computing anything. The empty string is valid.
pub fn validate(expr: &str) -> Result<()> {
    CronExpr::parse(expr).map(|_| ())
}

/// Next fire of `expr` strictly after `after`, in UTC.
///
/// `Ok(None)` for the empty expression: such tasks only fire when armed or
/// triggered explicitly.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    next_after_in(expr, &after)
}

/// Like [`next_after`], but the expression is evaluated in the zone of `after`.
pub fn next_after_in<Tz: TimeZone>(
    expr: &str,
    after: &DateTime<Tz>,
) -> Result<Option<DateTime<Tz>>> {
    Ok(CronExpr::parse(expr)?.and_then(|c| c.next_after(after)))
}

/// Up to `count` consecutive fires after `after`.
pub fn upcoming(expr: &str, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
    let Some(cron) = CronExpr::parse(expr)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(count);
    let mut cursor = after;
    while out.len() < count {
        match cron.next_after(&cursor) {
            Some(next) => {
                out.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    Ok(out)
}

fn expand_alias(expr: &str) -> Result<String> {
    if !expr.starts_with('@') {
        return Ok(expr.to_string());
    }
    let expanded = match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => return Err(invalid(expr, "unknown alias")),
    };
    Ok(expanded.to_string())
}

fn parse_field(text: &str, spec: &FieldSpec) -> std::result::Result<Field, String> {
    let mut values = BTreeSet::new();
    for item in text.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step `{step}` in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, spec)?;
            let hi = parse_value(b, spec)?;
            if lo > hi {
                return Err(format!(
                    "range {a}-{b} runs backwards in {} field",
                    spec.name
                ));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, spec)?;
            // `5/15` means "from 5 to the end, every 15"
            (v, if step.is_some() { spec.max } else { v })
        };

        let step = step.unwrap_or(1) as usize;
        values.extend((lo..=hi).step_by(step));
    }
    Ok(Field {
        values,
        star: text.starts_with('*'),
    })
}

fn parse_value(text: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let lower = text.to_ascii_lowercase();
            spec.names
                .iter()
                .position(|n| *n == lower)
                .map(|i| spec.min + i as u32)
                .ok_or_else(|| format!("unrecognised value `{text}` in {} field", spec.name))?
        }
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn render_weekdays(field: &Field) -> String {
    if field.values.len() == 7 {
        return "*".to_string();
    }
    join(field.values.iter().map(|d| CRON_WEEKDAYS[*d as usize].to_string()))
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(",")
}

fn invalid(expr: &str, reason: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("`{expr}`: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, FixedOffset, Timelike, Weekday};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        next_after(expr, after).unwrap().unwrap()
    }

    #[test]
    fn every_five_minutes() {
        assert_eq!(next("*/5 * * * *", at(2024, 5, 1, 10, 0, 0)), at(2024, 5, 1, 10, 5, 0));
        assert_eq!(next("*/5 * * * *", at(2024, 5, 1, 10, 3, 59)), at(2024, 5, 1, 10, 5, 0));
    }

    #[test]
    fn leap_day_only_in_leap_years() {
        assert_eq!(next("0 0 29 2 *", at(2024, 2, 28, 10, 0, 0)), at(2024, 2, 29, 0, 0, 0));
        assert_eq!(next("0 0 29 2 *", at(2023, 2, 28, 10, 0, 0)), at(2024, 2, 29, 0, 0, 0));
        assert_eq!(next("0 0 29 2 *", at(2024, 2, 29, 0, 0, 0)), at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn short_months_are_skipped() {
        // April has no 31st
        assert_eq!(next("0 12 31 * *", at(2024, 4, 1, 0, 0, 0)), at(2024, 5, 31, 12, 0, 0));
    }

    #[test]
    fn empty_expression_is_one_shot() {
        assert!(validate("").is_ok());
        assert!(validate("   ").is_ok());
        assert_eq!(next_after("", at(2024, 1, 1, 0, 0, 0)).unwrap(), None);
        assert!(upcoming("", at(2024, 1, 1, 0, 0, 0), 3).unwrap().is_empty());
    }

    #[test]
    fn aliases_expand() {
        let base = at(2024, 5, 15, 10, 30, 0);
        assert_eq!(next("@hourly", base), at(2024, 5, 15, 11, 0, 0));
        assert_eq!(next("@daily", base), at(2024, 5, 16, 0, 0, 0));
        assert_eq!(next("@midnight", base), at(2024, 5, 16, 0, 0, 0));
        assert_eq!(next("@monthly", base), at(2024, 6, 1, 0, 0, 0));
        assert_eq!(next("@yearly", base), at(2025, 1, 1, 0, 0, 0));
        assert_eq!(next("@annually", base), at(2025, 1, 1, 0, 0, 0));
        // 2024-05-15 is a Wednesday; the next Sunday is the 19th
        assert_eq!(next("@weekly", base), at(2024, 5, 19, 0, 0, 0));
        assert!(validate("@fortnightly").is_err());
    }

    #[test]
    fn weekday_names_ranges_and_sunday_seven() {
        let base = at(2024, 5, 17, 9, 0, 0); // Friday
        let n = next("0 9 * * mon-fri", base);
        assert_eq!(n, at(2024, 5, 20, 9, 0, 0));
        assert_eq!(n.weekday(), Weekday::Mon);

        let sunday = next("0 0 * * 7", base);
        assert_eq!(sunday.weekday(), Weekday::Sun);
        assert_eq!(next("0 0 * * 0", base), sunday);
        assert_eq!(next("0 0 * * SUN", base), sunday);
    }

    #[test]
    fn month_names_and_lists() {
        let n = next("0 0 1 jan,jul *", at(2024, 2, 1, 0, 0, 0));
        assert_eq!(n, at(2024, 7, 1, 0, 0, 0));
    }

    #[test]
    fn day_of_month_and_weekday_are_unioned() {
        // the 13th OR any Friday; 2024-05-01 is a Wednesday
        let base = at(2024, 5, 1, 0, 0, 0);
        let fires = upcoming("0 0 13 * fri", base, 3).unwrap();
        assert_eq!(
            fires,
            vec![at(2024, 5, 3, 0, 0, 0), at(2024, 5, 10, 0, 0, 0), at(2024, 5, 13, 0, 0, 0)]
        );
    }

    #[test]
    fn starred_weekday_step_intersects() {
        // `*/2` in the weekday field keeps the star semantics: dom AND dow
        let fires = upcoming("0 0 1-7 * */2", at(2024, 5, 1, 0, 0, 0), 2).unwrap();
        for f in fires {
            assert!(f.day() <= 7);
            assert_eq!(f.weekday().num_days_from_sunday() % 2, 0);
        }
    }

    #[test]
    fn optional_seconds_field() {
        let n = next("30 * * * * *", at(2024, 5, 1, 10, 0, 0));
        assert_eq!(n, at(2024, 5, 1, 10, 0, 30));
        assert_eq!(n.second(), 30);
    }

    #[test]
    fn steps_from_a_start_value() {
        let fires = upcoming("5/20 * * * *", at(2024, 5, 1, 10, 0, 0), 3).unwrap();
        let minutes: Vec<u32> = fires.iter().map(|f| f.minute()).collect();
        assert_eq!(minutes, vec![5, 25, 45]);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in [
            "invalid",
            "* * * *",
            "* * * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "* * * foo *",
            "0 0 30 2 *",
        ] {
            let err = validate(bad).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidSchedule(_)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn time_zone_of_the_reference_is_honoured() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let after = tz.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let n = next_after_in("0 9 * * *", &after).unwrap().unwrap();
        assert_eq!(n, tz.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        assert_eq!(n.with_timezone(&Utc), at(2024, 5, 1, 7, 0, 0));
    }

    #[test]
    fn source_is_kept_trimmed() {
        let c = CronExpr::parse("  @daily ").unwrap().unwrap();
        assert_eq!(c.source(), "@daily");
    }
}
