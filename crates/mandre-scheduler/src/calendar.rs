//! Calendar (cron-like) recurrence arithmetic.
//!
//! Pure functions over cron expressions. Both the classic five-field form
//! (`min hour dom mon dow`) and the six/seven-field form with seconds (and an
//! optional year) are accepted. Five-field expressions fire at second zero.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::SchedulerError;

/// A parsed calendar expression.
#[derive(Debug, Clone)]
pub struct CalendarExpression {
    source: String,
    schedule: Schedule,
}

impl CalendarExpression {
    /// Parse a calendar expression.
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(SchedulerError::InvalidSchedule(
                "calendar expression is empty".to_string(),
            ));
        }

        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            SchedulerError::InvalidSchedule(format!(
                "unparsable calendar expression '{}': {}",
                trimmed, e
            ))
        })?;

        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as written by the registrant.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `after`, or `None` if the expression
    /// has no further occurrences.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Compute the next occurrence of `expression` strictly after `after`.
pub fn next_after(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    Ok(CalendarExpression::parse(expression)?.next_after(after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_expression_fires_on_minute_boundary() {
        let next = next_after("*/15 * * * *", at(10, 7, 30)).unwrap().unwrap();
        assert_eq!(next, at(10, 15, 0));
    }

    #[test]
    fn test_six_field_expression_with_seconds() {
        let next = next_after("30 * * * * *", at(10, 7, 30)).unwrap().unwrap();
        assert_eq!(next, at(10, 8, 30));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let expr = CalendarExpression::parse("0 12 * * *").unwrap();
        let noon = at(12, 0, 0);
        let next = expr.next_after(noon).unwrap();
        assert!(next > noon);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_expression_in_the_past_has_no_next() {
        let expr = CalendarExpression::parse("0 0 0 1 1 * 2001").unwrap();
        assert!(expr.next_after(at(0, 0, 0)).is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            CalendarExpression::parse("every tuesday"),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(matches!(
            CalendarExpression::parse("   "),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_source_is_trimmed() {
        let expr = CalendarExpression::parse("  0 9 * * MON  ").unwrap();
        assert_eq!(expr.source(), "0 9 * * MON");
    }
}
