//! Schedule model: when is a task group next due?
//!
//! Two variants are supported:
//! - `Cron`: standard 5-field expression (minute hour day-of-month month day-of-week),
//!   evaluated in UTC.
//! - `EverySeconds(n)`: aligned to an absolute epoch grid of `n` seconds.
//!
//! Both variants are validated at construction time; evaluation never fails.
//! `next_due_after` always returns an instant strictly greater than the reference.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ScheduleError;

/// Upper bound on the candidate walk in `CronExpression::next_after`.
///
/// Construction rejects expressions that can never fire, so in practice the walk
/// ends long before this (Feb 29 every 8 years is the worst realistic case).
const MAX_CRON_STEPS: usize = 100_000;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Longest possible length of each month (Feb counted as leap).
const MAX_DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Rule computing the next due instant after a reference instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronExpression),
    EverySeconds(u32),
}

impl Schedule {
    /// Parse a schedule string.
    ///
    /// `"every N seconds"` yields the interval variant; anything else must be a
    /// 5-field cron expression.
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let trimmed = input.trim();
        if let Some(rest) = trimmed.strip_prefix("every ")
            && let Some(count) = rest.strip_suffix(" seconds")
        {
            let seconds: u32 = count
                .parse()
                .map_err(|_| ScheduleError::InvalidInterval(input.to_string()))?;
            return Self::every_seconds(seconds);
        }

        Ok(Schedule::Cron(CronExpression::parse(trimmed)?))
    }

    /// Fixed-interval schedule. `seconds` must be non-zero.
    pub fn every_seconds(seconds: u32) -> Result<Self, ScheduleError> {
        if seconds == 0 {
            return Err(ScheduleError::InvalidInterval("every 0 seconds".to_string()));
        }
        Ok(Schedule::EverySeconds(seconds))
    }

    /// Build a cron schedule from a partial field map; unset fields default to `*`.
    pub fn from_fields(fields: &CronFields) -> Result<Self, ScheduleError> {
        Ok(Schedule::Cron(CronExpression::parse(&fields.to_expression())?))
    }

    /// Next due instant, strictly after `reference`.
    ///
    /// Callers pass the group's *last completed* instant, not wall-clock now, so a
    /// run that finishes late shifts every subsequent window.
    pub fn next_due_after(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Cron(expr) => expr.next_after(reference),
            Schedule::EverySeconds(seconds) => next_interval_boundary(*seconds, reference),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(expr) => expr.fmt(f),
            Schedule::EverySeconds(seconds) => write!(f, "every {seconds} seconds"),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `n * ceil((ts + 1) / n)`: the first grid point at or after one second past
/// the reference. Sub-second precision of the reference is discarded.
fn next_interval_boundary(seconds: u32, reference: DateTime<Utc>) -> DateTime<Utc> {
    let n = i64::from(seconds);
    let target = reference.timestamp() + 1;
    let next = target + (n - target.rem_euclid(n)) % n;
    DateTime::from_timestamp(next, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ========================================
// Structured shorthand
// ========================================

/// A single value in the structured shorthand: either text (`"*/5"`) or a bare number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronFieldValue {
    Number(u32),
    Text(String),
}

impl Default for CronFieldValue {
    fn default() -> Self {
        CronFieldValue::Text("*".to_string())
    }
}

impl fmt::Display for CronFieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronFieldValue::Number(n) => n.fmt(f),
            CronFieldValue::Text(s) => s.fmt(f),
        }
    }
}

/// Partial cron field map, e.g. `{ "minute": "15,45" }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronFields {
    #[serde(default)]
    pub minute: CronFieldValue,
    #[serde(default)]
    pub hour: CronFieldValue,
    #[serde(default)]
    pub day_of_month: CronFieldValue,
    #[serde(default)]
    pub month: CronFieldValue,
    #[serde(default)]
    pub day_of_week: CronFieldValue,
}

impl CronFields {
    pub fn to_expression(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

// ========================================
// Cron expression
// ========================================

/// Set of allowed values for one cron field (all fields fit in 0..=59).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }

    fn values(self) -> impl Iterator<Item = u32> {
        (0..64).filter(move |v| self.contains(*v))
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldLimits {
    name: &'static str,
    min: u32,
    max: u32,
    aliases: &'static [&'static str],
    alias_base: u32,
}

const MINUTE: FieldLimits = FieldLimits { name: "minute", min: 0, max: 59, aliases: &[], alias_base: 0 };
const HOUR: FieldLimits = FieldLimits { name: "hour", min: 0, max: 23, aliases: &[], alias_base: 0 };
const DAY_OF_MONTH: FieldLimits =
    FieldLimits { name: "day_of_month", min: 1, max: 31, aliases: &[], alias_base: 0 };
const MONTH: FieldLimits =
    FieldLimits { name: "month", min: 1, max: 12, aliases: &MONTH_NAMES, alias_base: 1 };
// 7 is accepted as an alias for Sunday and folded to 0 after parsing.
const DAY_OF_WEEK: FieldLimits =
    FieldLimits { name: "day_of_week", min: 0, max: 7, aliases: &WEEKDAY_NAMES, alias_base: 0 };

/// A validated 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::FieldCount {
                expression: expression.to_string(),
                found: parts.len(),
            });
        }

        let minutes = parse_field(parts[0], MINUTE)?;
        let hours = parse_field(parts[1], HOUR)?;
        let days_of_month = parse_field(parts[2], DAY_OF_MONTH)?;
        let months = parse_field(parts[3], MONTH)?;
        let mut days_of_week = parse_field(parts[4], DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.0 &= !(1u64 << 7);
            days_of_week.insert(0);
        }

        let expr = Self {
            source: parts.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        };

        if !expr.can_ever_fire() {
            return Err(ScheduleError::NeverFires(expression.to_string()));
        }
        Ok(expr)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Rejects day-of-month/month combinations with no calendar date (e.g. Feb 30).
    /// When day-of-week is also restricted the two are OR-ed, so some day always matches.
    fn can_ever_fire(&self) -> bool {
        if !self.dom_restricted || self.dow_restricted {
            return true;
        }
        self.months.values().any(|month| {
            let longest = MAX_DAYS_IN_MONTH[(month - 1) as usize];
            self.days_of_month.values().any(|day| day <= longest)
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `reference`.
    pub fn next_after(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let seconds = reference.timestamp();
        let minute_start = seconds - seconds.rem_euclid(60);
        let Some(start) = DateTime::from_timestamp(minute_start + 60, 0) else {
            return DateTime::<Utc>::MAX_UTC;
        };

        let mut candidate = start.naive_utc();
        for _ in 0..MAX_CRON_STEPS {
            if !self.months.contains(candidate.month()) {
                candidate = match start_of_next_month(candidate) {
                    Some(next) => next,
                    None => break,
                };
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = match candidate.date().succ_opt() {
                    Some(next) => next.and_time(chrono::NaiveTime::MIN),
                    None => break,
                };
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                let hour_start = candidate - Duration::minutes(i64::from(candidate.minute()));
                candidate = hour_start + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return candidate.and_utc();
        }

        // Unreachable for validated expressions; treat as "never due".
        DateTime::<Utc>::MAX_UTC
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

fn start_of_next_month(at: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).map(|d| d.and_time(chrono::NaiveTime::MIN))
}

fn parse_field(field: &str, limits: FieldLimits) -> Result<FieldSet, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidField {
        field: limits.name,
        value: field.to_string(),
        reason,
    };

    let mut set = FieldSet(0);
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("invalid step `{step}`")))?;
                if step == 0 {
                    return Err(invalid("step must be greater than zero".to_string()));
                }
                if step > limits.max {
                    return Err(invalid(format!("step {step} exceeds {}", limits.max)));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" {
            (limits.min, limits.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, limits, &invalid)?, parse_value(high, limits, &invalid)?)
        } else {
            let value = parse_value(range, limits, &invalid)?;
            // `N/S` means "from N to the end of the range, every S".
            (value, if step.is_some() { limits.max } else { value })
        };

        if low > high {
            return Err(invalid(format!("range start {low} is after range end {high}")));
        }

        let step = step.unwrap_or(1);
        let mut value = low;
        while value <= high {
            set.insert(value);
            value += step;
        }
    }
    Ok(set)
}

fn parse_value(
    raw: &str,
    limits: FieldLimits,
    invalid: &impl Fn(String) -> ScheduleError,
) -> Result<u32, ScheduleError> {
    if raw.is_empty() {
        return Err(invalid("empty value".to_string()));
    }

    let value = match raw.parse::<u32>() {
        Ok(value) => value,
        Err(_) => limits
            .aliases
            .iter()
            .position(|alias| alias.eq_ignore_ascii_case(raw))
            .map(|idx| idx as u32 + limits.alias_base)
            .ok_or_else(|| invalid(format!("`{raw}` is not a number")))?,
    };

    if value < limits.min || value > limits.max {
        return Err(invalid(format!(
            "{value} is outside {}..={}",
            limits.min, limits.max
        )));
    }
    Ok(value)
}
