// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quartz to crontab conversion for sync schedules.
//!
//! Connector schedules are written in the quartz dialect
//! (`sec min hour day-of-month month day-of-week [year]`). They are validated
//! field by field, then reduced to the five crontab fields and evaluated with
//! `croner`.

use chrono::{DateTime, Datelike, Utc};
use croner::Cron;
use thiserror::Error;
use tracing::debug;

/// Schedule conversion and evaluation errors.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum CronError {
    #[error("Quartz expression '{expression}' must have 6 or 7 fields")]
    FieldCount { expression: String },

    #[error("Invalid {field} value '{value}' in quartz expression")]
    InvalidField { field: &'static str, value: String },

    #[error("Unsupported expression '{value}' with {feature} in {field}")]
    Unsupported {
        field: &'static str,
        value: String,
        feature: char,
    },

    #[error("Unable to parse crontab '{expression}': {reason}")]
    Parse { expression: String, reason: String },

    #[error("Crontab '{expression}' has no occurrence after {after}")]
    NoOccurrence {
        expression: String,
        after: DateTime<Utc>,
    },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [(&'static str, u32)],
}

const MONTH_NAMES: &[(&str, u32)] = &[
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

const DAY_NAMES: &[(&str, u32)] = &[
    ("MON", 1),
    ("TUE", 2),
    ("WED", 3),
    ("THU", 4),
    ("FRI", 5),
    ("SAT", 6),
    ("SUN", 7),
];

const SECONDS: FieldSpec = FieldSpec {
    name: "seconds",
    min: 0,
    max: 59,
    names: &[],
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minutes",
    min: 0,
    max: 59,
    names: &[],
};
const HOURS: FieldSpec = FieldSpec {
    name: "hours",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day of month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day of week",
    min: 1,
    max: 7,
    names: DAY_NAMES,
};

/// Convert a quartz expression to a five-field crontab expression.
///
/// `?` is read as `*`. Seconds and year are validated and dropped.
/// `#`, `L` and `W` (other than in `WED`) are rejected in the day fields.
pub fn quartz_to_crontab(expression: &str) -> Result<String, CronError> {
    let converted = expression.replace('?', "*");
    let items: Vec<&str> = converted.split_whitespace().collect();
    if items.len() < 6 || items.len() > 7 {
        return Err(CronError::FieldCount {
            expression: expression.to_string(),
        });
    }

    check_supported(&DAY_OF_MONTH, items[3])?;
    check_supported(&DAY_OF_WEEK, items[5])?;

    validate_field(&SECONDS, items[0])?;
    validate_field(&MINUTES, items[1])?;
    validate_field(&HOURS, items[2])?;
    validate_field(&DAY_OF_MONTH, items[3])?;
    validate_field(&MONTH, items[4])?;
    validate_field(&DAY_OF_WEEK, items[5])?;
    if let Some(year) = items.get(6) {
        let spec = FieldSpec {
            name: "year",
            min: 1970,
            max: Utc::now().year() as u32 + 100,
            names: &[],
        };
        validate_field(&spec, year)?;
    }

    let crontab = format!(
        "{} {} {} {} {}",
        items[1], items[2], items[3], items[4], items[5]
    );
    debug!(
        quartz = %expression,
        crontab = %crontab,
        "Converted quartz expression to crontab"
    );
    Ok(crontab)
}

/// Next occurrence of a crontab expression strictly after `after`.
pub fn next_occurrence_after(
    crontab: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let cron = Cron::new(crontab).parse().map_err(|e| CronError::Parse {
        expression: crontab.to_string(),
        reason: e.to_string(),
    })?;

    cron.find_next_occurrence(&after, false)
        .map_err(|_| CronError::NoOccurrence {
            expression: crontab.to_string(),
            after,
        })
}

fn check_supported(spec: &FieldSpec, value: &str) -> Result<(), CronError> {
    let upper = value.to_uppercase();
    let unsupported = |feature| CronError::Unsupported {
        field: spec.name,
        value: value.to_string(),
        feature,
    };

    if upper.contains('#') {
        return Err(unsupported('#'));
    }
    if upper.contains('L') {
        return Err(unsupported('L'));
    }
    if upper.contains('W') && !upper.contains("WED") {
        return Err(unsupported('W'));
    }
    Ok(())
}

/// Validate a comma separated list of `start|*[-end][/step]` items.
fn validate_field(spec: &FieldSpec, value: &str) -> Result<(), CronError> {
    let invalid = || CronError::InvalidField {
        field: spec.name,
        value: value.to_string(),
    };

    for item in value.split(',') {
        let mut item = item.to_uppercase();
        for (name, number) in spec.names {
            item = item.replace(name, &number.to_string());
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item.as_str(), None),
        };
        if let Some(step) = step {
            let step: u32 = step.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(invalid());
            }
        }

        if range == "*" {
            continue;
        }

        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (start, Some(end)),
            None => (range, None),
        };
        let start: u32 = start.parse().map_err(|_| invalid())?;
        let end: u32 = match end {
            Some(end) => end.parse().map_err(|_| invalid())?,
            None => start,
        };

        if start < spec.min || start > spec.max || end < spec.min || end > spec.max {
            return Err(invalid());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_quartz_to_crontab() {
        assert_eq!(quartz_to_crontab("0 0 12 * * ?").unwrap(), "0 12 * * *");
        assert_eq!(
            quartz_to_crontab("0 15 10 ? * MON-FRI").unwrap(),
            "15 10 * * MON-FRI"
        );
        assert_eq!(
            quartz_to_crontab("0 0/5 14,18 * JAN-MAR ? 2030").unwrap(),
            "0/5 14,18 * JAN-MAR *"
        );
        assert_eq!(quartz_to_crontab("0 0 * ? * WED").unwrap(), "0 * * * WED");
    }

    #[test]
    fn test_field_count() {
        assert!(matches!(
            quartz_to_crontab("0 0 * * *"),
            Err(CronError::FieldCount { .. })
        ));
        assert!(matches!(
            quartz_to_crontab("0 0 0 * * ? 2030 extra"),
            Err(CronError::FieldCount { .. })
        ));
    }

    #[test]
    fn test_unsupported_features() {
        for (expression, feature) in [
            ("0 0 0 ? * 2#1", '#'),
            ("0 0 0 L * ?", 'L'),
            ("0 0 0 ? * 5L", 'L'),
            ("0 0 0 15W * ?", 'W'),
        ] {
            match quartz_to_crontab(expression) {
                Err(CronError::Unsupported { feature: f, .. }) => assert_eq!(f, feature),
                other => panic!("{} should be unsupported, got {:?}", expression, other),
            }
        }
    }

    #[test]
    fn test_out_of_range_values() {
        for expression in [
            "0 61 * * * ?",
            "0 0 24 * * ?",
            "0 0 0 0 * ?",
            "0 0 0 * 13 ?",
            "0 0 0 ? * 8",
            "0 0 0 * * ? 1969",
            "0 */0 * * * ?",
            "0 abc * * * ?",
        ] {
            assert!(
                matches!(
                    quartz_to_crontab(expression),
                    Err(CronError::InvalidField { .. })
                ),
                "{} should be rejected",
                expression
            );
        }
    }

    #[test]
    fn test_next_occurrence_after() {
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 0).unwrap();
        let next = next_occurrence_after("0 12 * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap());

        let on_the_hour = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let next = next_occurrence_after("0 12 * * *", on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_unparsable_crontab() {
        let after = Utc::now();
        assert!(matches!(
            next_occurrence_after("not a cron", after),
            Err(CronError::Parse { .. })
        ));
    }
}
