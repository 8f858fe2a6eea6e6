//! Five-field recurrence expressions: `MIN HOUR DOM MON DOW`.
//!
//! Supports `*`, single values, lists (`0,15,30,45`), ranges (`1-5`), and
//! steps (`*/10`, `10-50/5`). Day-of-month and day-of-week follow the
//! classic union rule: when both fields are restricted, a day matches if
//! either field matches it.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ScheduleParseError(String);

/// A parsed recurrence expression, interpreted as an infinite monotone
/// sequence of future timestamps at minute precision.
#[derive(Debug, Clone)]
pub struct Schedule {
    minutes: u64,
    hours: u64,
    dom: u64,
    months: u64,
    dow: u64,
    dom_star: bool,
    dow_star: bool,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleParseError(format!(
                "expected 5 fields (minute hour dom month dow), got {}",
                fields.len()
            )));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59)?;
        let (hours, _) = parse_field(fields[1], 0, 23)?;
        let (dom, dom_star) = parse_field(fields[2], 1, 31)?;
        let (months, _) = parse_field(fields[3], 1, 12)?;
        // 7 is accepted as an alias for Sunday.
        let (raw_dow, dow_star) = parse_field(fields[4], 0, 7)?;
        let dow = fold_sunday(raw_dow);

        Ok(Self {
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_star,
            dow_star,
        })
    }

    /// The next matching instant strictly after `after`, at minute
    /// precision. Returns `None` if nothing matches within four years
    /// (an unsatisfiable day/month combination).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after) + Duration::minutes(1);
        let limit = after + Duration::days(4 * 366);

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = next_month_start(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = next_day_start(t)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t = t + Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = bit(self.dom, t.day());
        let dow_ok = bit(self.dow, t.weekday().num_days_from_sunday());
        match (self.dom_star, self.dow_star) {
            (true, true) => true,
            (true, false) => dow_ok,
            (false, true) => dom_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }
}

impl std::str::FromStr for Schedule {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn fold_sunday(mask: u64) -> u64 {
    if bit(mask, 7) {
        (mask & !(1u64 << 7)) | 1
    } else {
        mask
    }
}

fn range_mask(lo: u32, hi: u32, step: u32) -> u64 {
    let mut mask = 0u64;
    let mut v = lo;
    while v <= hi {
        mask |= 1u64 << v;
        v += step;
    }
    mask
}

/// Parse one field into a bitmask. The second return value reports whether
/// the field is unrestricted (`*` or `*/step`), which drives the
/// day-of-month/day-of-week union rule.
fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool), ScheduleParseError> {
    let mut mask = 0u64;
    let mut star = false;

    for term in field.split(',') {
        if term.is_empty() {
            return Err(ScheduleParseError(format!("empty term in field {field:?}")));
        }

        let (range, step) = match term.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| ScheduleParseError(format!("invalid step in {term:?}")))?;
                if step == 0 {
                    return Err(ScheduleParseError(format!("zero step in {term:?}")));
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (lo, hi) = if range == "*" {
            star = true;
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo = parse_value(lo, min, max, field)?;
            let hi = parse_value(hi, min, max, field)?;
            if lo > hi {
                return Err(ScheduleParseError(format!("inverted range {range:?}")));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, min, max, field)?;
            (v, v)
        };

        mask |= range_mask(lo, hi, step);
    }

    Ok((mask, star))
}

fn parse_value(s: &str, min: u32, max: u32, field: &str) -> Result<u32, ScheduleParseError> {
    let v: u32 = s
        .parse()
        .map_err(|_| ScheduleParseError(format!("invalid value {s:?} in field {field:?}")))?;
    if v < min || v > max {
        return Err(ScheduleParseError(format!(
            "value {v} out of range {min}-{max} in field {field:?}"
        )));
    }
    Ok(v)
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn next_day_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

fn next_month_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}
