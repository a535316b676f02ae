//! 5-field cron expression matcher.
//!
//! Minute, hour, day-of-month, month, weekday (0 = Sunday, 7 normalized to
//! 0). Each field is a comma-separated list of `*`, integers, ranges `a-b`,
//! any of those with a step `/n`. Matching is done against local naive time;
//! `next_after` probes forward minute-by-minute, bounded by one leap year.

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};

/// Lookahead bound for `next_after`: one leap year of minutes.
pub const MAX_LOOKAHEAD_MINUTES: u32 = 60 * 24 * 366;

const FIELD_SPECS: [(&str, u32, u32, usize); 5] = [
    ("minute", 0, 59, 60),
    ("hour", 0, 23, 24),
    ("day", 1, 31, 31),
    ("month", 1, 12, 12),
    ("weekday", 0, 6, 7),
];

/// Errors produced while parsing or evaluating a cron expression.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron expression must contain 5 fields")]
    FieldCount,
    #[error("invalid {field} segment: {segment}")]
    InvalidSegment { field: &'static str, segment: String },
    #[error("invalid step for {field}")]
    InvalidStep { field: &'static str },
    #[error("{field} values out of range")]
    OutOfRange { field: &'static str },
    #[error("unable to compute next run within lookahead window")]
    LookaheadExceeded,
}

/// A parsed cron expression: expanded value sets plus wildcard tags per field.
#[derive(Debug, Clone)]
pub struct CronExpression {
    fields: [Vec<u32>; 5],
    wildcards: [bool; 5],
}

impl CronExpression {
    /// Parse a 5-field expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount);
        }
        let mut fields: [Vec<u32>; 5] = Default::default();
        let mut wildcards = [false; 5];
        for (index, (part, spec)) in parts.iter().zip(FIELD_SPECS.iter()).enumerate() {
            let (values, wildcard) = Self::expand_field(part, spec)?;
            fields[index] = values;
            wildcards[index] = wildcard;
        }
        Ok(Self { fields, wildcards })
    }

    fn expand_field(
        token: &str,
        spec: &(&'static str, u32, u32, usize),
    ) -> Result<(Vec<u32>, bool), CronError> {
        let (name, min_value, max_value, span) = *spec;
        let mut values: Vec<u32> = Vec::new();
        let mut wildcard = false;
        for raw_item in token.split(',') {
            let original = raw_item.trim();
            let original = if original.is_empty() { "*" } else { original };
            let (item, step) = match original.split_once('/') {
                Some((base, step_str)) => {
                    let base = if base.is_empty() { "*" } else { base };
                    let step: u32 = step_str
                        .parse()
                        .map_err(|_| CronError::InvalidStep { field: name })?;
                    if step == 0 {
                        return Err(CronError::InvalidStep { field: name });
                    }
                    (base, step)
                }
                None => (original, 1),
            };
            let expanded = Self::expand_range(item, min_value, max_value, name)?;
            let first = expanded[0];
            for value in expanded {
                if (value - first) % step == 0 && !values.contains(&value) {
                    values.push(value);
                }
            }
            wildcard = wildcard || original == "*";
        }
        if name == "weekday" {
            // 7 is accepted as an alias for Sunday
            for value in values.iter_mut() {
                if *value == 7 {
                    *value = 0;
                }
            }
        }
        values.sort_unstable();
        values.dedup();
        let full_span = values.len() == span;
        Ok((values, wildcard || full_span))
    }

    fn expand_range(
        item: &str,
        min_value: u32,
        max_value: u32,
        field: &'static str,
    ) -> Result<Vec<u32>, CronError> {
        let invalid = || CronError::InvalidSegment {
            field,
            segment: item.to_string(),
        };
        if item == "*" {
            return Ok((min_value..=max_value).collect());
        }
        if let Ok(single) = item.parse::<u32>() {
            // weekday 7 is accepted and normalized to 0 later
            let upper = if field == "weekday" { 7 } else { max_value };
            if single < min_value || single > upper {
                return Err(CronError::OutOfRange { field });
            }
            return Ok(vec![single]);
        }
        if let Some((start_str, end_str)) = item.split_once('-') {
            let start: u32 = start_str.parse().map_err(|_| invalid())?;
            let end: u32 = end_str.parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            let upper = if field == "weekday" { 7 } else { max_value };
            if start < min_value || end > upper {
                return Err(CronError::OutOfRange { field });
            }
            return Ok((start..=end).collect());
        }
        Err(invalid())
    }

    /// First matching moment strictly after `moment`, at minute precision.
    pub fn next_after(&self, moment: NaiveDateTime) -> Result<NaiveDateTime, CronError> {
        let base = moment
            .with_second(0)
            .and_then(|m| m.with_nanosecond(0))
            .unwrap_or(moment);
        let mut candidate = base;
        for _ in 0..MAX_LOOKAHEAD_MINUTES {
            candidate += Duration::minutes(1);
            if self.matches(candidate) {
                return Ok(candidate);
            }
        }
        Err(CronError::LookaheadExceeded)
    }

    fn matches(&self, candidate: NaiveDateTime) -> bool {
        let minute = candidate.minute();
        let hour = candidate.hour();
        let day = candidate.day();
        let month = candidate.month();
        let weekday = candidate.weekday().num_days_from_sunday();

        let dom_match = self.fields[2].contains(&day);
        let dow_match = self.fields[4].contains(&weekday);
        // Standard cron rule: when both calendar fields are restricted, a
        // candidate matches if either one matches.
        let calendar_ok = match (self.wildcards[2], self.wildcards[4]) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        };

        self.fields[0].contains(&minute)
            && self.fields[1].contains(&hour)
            && self.fields[3].contains(&month)
            && calendar_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(
            CronExpression::parse("* * * *"),
            Err(CronError::FieldCount)
        ));
        assert!(matches!(
            CronExpression::parse("* * * * * *"),
            Err(CronError::FieldCount)
        ));
    }

    #[test]
    fn rejects_bad_tokens() {
        assert!(matches!(
            CronExpression::parse("x * * * *"),
            Err(CronError::InvalidSegment { field: "minute", .. })
        ));
        assert!(matches!(
            CronExpression::parse("* * * * */0"),
            Err(CronError::InvalidStep { field: "weekday" })
        ));
        assert!(matches!(
            CronExpression::parse("* 10-5 * * *"),
            Err(CronError::InvalidSegment { field: "hour", .. })
        ));
        assert!(matches!(
            CronExpression::parse("* 25 * * *"),
            Err(CronError::OutOfRange { field: "hour" })
        ));
    }

    #[test]
    fn quarter_hour_steps() {
        // */15 from 00:00:07 lands on the next quarter boundary.
        let cron = CronExpression::parse("*/15 * * * *").unwrap();
        let next = cron.next_after(dt(2025, 1, 1, 0, 0, 7)).unwrap();
        assert_eq!(next, dt(2025, 1, 1, 0, 15, 0));
    }

    #[test]
    fn dom_dow_union() {
        // Both calendar fields restricted: the earlier of "next 1st" and
        // "next Monday" wins. 2025-06-01 is a Sunday.
        let cron = CronExpression::parse("0 0 1 * 1").unwrap();
        let next = cron.next_after(dt(2025, 6, 1, 12, 0, 0)).unwrap();
        assert_eq!(next, dt(2025, 6, 2, 0, 0, 0));
    }

    #[test]
    fn dom_only_when_dow_is_wildcard() {
        let cron = CronExpression::parse("0 0 15 * *").unwrap();
        let next = cron.next_after(dt(2025, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, dt(2025, 6, 15, 0, 0, 0));
    }

    #[test]
    fn full_range_expansion_counts_as_wildcard() {
        // 0-6 covers every weekday, so only day-of-month constrains.
        let cron = CronExpression::parse("0 0 10 * 0-6").unwrap();
        let next = cron.next_after(dt(2025, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, dt(2025, 6, 10, 0, 0, 0));
    }

    #[test]
    fn weekday_seven_is_sunday() {
        let cron = CronExpression::parse("0 0 * * 7").unwrap();
        // 2025-06-04 is a Wednesday; the next Sunday is 2025-06-08.
        let next = cron.next_after(dt(2025, 6, 4, 0, 0, 0)).unwrap();
        assert_eq!(next, dt(2025, 6, 8, 0, 0, 0));
    }

    #[test]
    fn range_with_step() {
        let cron = CronExpression::parse("0 9-17/4 * * *").unwrap();
        let mut moment = dt(2025, 6, 1, 0, 0, 0);
        let mut hours = Vec::new();
        for _ in 0..3 {
            moment = cron.next_after(moment).unwrap();
            hours.push(moment.hour());
        }
        assert_eq!(hours, vec![9, 13, 17]);
    }

    #[test]
    fn list_of_values() {
        let cron = CronExpression::parse("5,35 * * * *").unwrap();
        let next = cron.next_after(dt(2025, 6, 1, 10, 5, 0)).unwrap();
        assert_eq!(next, dt(2025, 6, 1, 10, 35, 0));
    }

    #[test]
    fn next_is_strictly_after_moment() {
        // Matching minute at second 59 still advances to the next match.
        let cron = CronExpression::parse("* * * * *").unwrap();
        let next = cron.next_after(dt(2025, 6, 1, 10, 5, 59)).unwrap();
        assert_eq!(next, dt(2025, 6, 1, 10, 6, 0));
    }

    #[test]
    fn forward_progress() {
        let cron = CronExpression::parse("*/7 3 * * 2").unwrap();
        let first = cron.next_after(dt(2025, 1, 1, 0, 0, 0)).unwrap();
        let second = cron.next_after(first).unwrap();
        assert!(second > first);
    }

    #[test]
    fn lookahead_exceeded_for_impossible_date() {
        // February 30th never happens.
        let cron = CronExpression::parse("0 0 30 2 *").unwrap();
        assert!(matches!(
            cron.next_after(dt(2025, 1, 1, 0, 0, 0)),
            Err(CronError::LookaheadExceeded)
        ));
    }
}
