//! Five-field cron expressions (`minute hour day-of-month month day-of-week`).

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Daily at midnight.
pub const DEFAULT_CRON_EXPRESSION: &str = "0 0 * * *";

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Longest month length, indexed by month number minus one.
const MONTH_LENGTHS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Numeric value of the first entry in `names`.
    names_offset: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec {
        name: "minute",
        min: 0,
        max: 59,
        names: &[],
        names_offset: 0,
    },
    FieldSpec {
        name: "hour",
        min: 0,
        max: 23,
        names: &[],
        names_offset: 0,
    },
    FieldSpec {
        name: "day-of-month",
        min: 1,
        max: 31,
        names: &[],
        names_offset: 0,
    },
    FieldSpec {
        name: "month",
        min: 1,
        max: 12,
        names: &MONTH_NAMES,
        names_offset: 1,
    },
    FieldSpec {
        name: "day-of-week",
        min: 0,
        max: 7,
        names: &WEEKDAY_NAMES,
        names_offset: 0,
    },
];

const DAY_OF_MONTH: usize = 2;
const MONTH: usize = 3;
const DAY_OF_WEEK: usize = 4;

/// A validated five-field cron expression.
///
/// Stored and displayed in its normalized form (single spaces between fields).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression(String);

impl CronExpression {
    /// Parse and validate a five-field cron expression.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidCron`] when the expression does not have
    /// exactly five fields, a field contains an out-of-range value, both
    /// day fields are restricted, or the day-of-month never occurs in any of
    /// the allowed months.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != FIELDS.len() {
            return Err(invalid(
                raw,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut sets = [0_u64; 5];
        for (i, (field, spec)) in fields.iter().zip(FIELDS.iter()).enumerate() {
            sets[i] = expand_field(field, spec).map_err(|reason| invalid(raw, reason))?;
        }

        // Standard cron fires when either restricted day field matches; the
        // job runner requires both. Only one of them may be restricted.
        if !fields[DAY_OF_MONTH].starts_with('*') && !fields[DAY_OF_WEEK].starts_with('*') {
            return Err(invalid(
                raw,
                "day-of-month and day-of-week cannot both be restricted; use * for one of them"
                    .to_string(),
            ));
        }

        if !day_occurs(sets[DAY_OF_MONTH], sets[MONTH]) {
            return Err(invalid(
                raw,
                "day-of-month never occurs in the allowed months".to_string(),
            ));
        }

        Ok(Self(fields.join(" ")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render as the seconds-first six-field form used by the job runner.
    ///
    /// Firings happen at second zero of the matching minute.
    #[must_use]
    pub fn to_job_schedule(&self) -> String {
        format!("0 {}", self.0)
    }
}

impl Default for CronExpression {
    fn default() -> Self {
        Self(DEFAULT_CRON_EXPRESSION.to_string())
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CronExpression {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronExpression> for String {
    fn from(value: CronExpression) -> Self {
        value.0
    }
}

fn invalid(raw: &str, reason: String) -> CoreError {
    CoreError::InvalidCron {
        expression: raw.to_string(),
        reason,
    }
}

/// Expands a field into a bit set of the values it allows.
fn expand_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut set = 0_u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };

        let step = match step {
            None => 1,
            Some(step) => match step.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(format!(
                        "{} step \"{step}\" is not a positive integer",
                        spec.name
                    ))
                }
            },
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else {
            match range.split_once('-') {
                Some((start, end)) => {
                    let start = parse_value(start, spec)?;
                    let end = parse_value(end, spec)?;
                    if end < start {
                        return Err(format!("{} range {start}-{end} is reversed", spec.name));
                    }
                    (start, end)
                }
                // `5/15` runs from 5 to the end of the field.
                None if step > 1 => (parse_value(range, spec)?, spec.max),
                None => {
                    let value = parse_value(range, spec)?;
                    (value, value)
                }
            }
        };

        for value in (start..=end).step_by(step as usize) {
            set |= 1 << value;
        }
    }
    Ok(set)
}

/// Whether some allowed day-of-month fits in some allowed month.
fn day_occurs(days: u64, months: u64) -> bool {
    (1..=12_u32)
        .filter(|m| months & (1 << m) != 0)
        .any(|m| (1..=MONTH_LENGTHS[m as usize - 1]).any(|d| days & (1 << d) != 0))
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(raw))
            .and_then(|idx| u32::try_from(idx).ok())
            .map(|idx| idx + spec.names_offset)
            .ok_or_else(|| format!("{} value \"{raw}\" is not recognised", spec.name))?,
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} value {value} is outside {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}
