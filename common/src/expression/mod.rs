// Schedule expression engine
//
// Every schedule form (instant, cron, repeating ISO-8601 interval, relative
// duration) is parsed into `ScheduleExpression` and resolved to the next run
// time after a previous occurrence.

mod crontab;
mod relative;
mod repeating;
mod span;

pub use crontab::{looks_like_cron, next_cron, parse_cron};
pub use relative::{duration_to_iso, format_period, parse_period, relative_to_iso, RelativeDuration};
pub use repeating::{parse_repeating, Repeats, RepeatingInterval};
pub use span::CalendarSpan;

use crate::errors::ExpressionError;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;

/// Parse a date (`YYYY-MM-DD`, UTC midnight) or an RFC 3339 timestamp
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

/// Canonical instant form: `YYYY-MM-DDTHH:MM:SS.mmmZ`
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A parsed schedule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpression {
    /// Never runs
    Cancel,
    /// Runs once at the given time
    Instant(DateTime<Utc>),
    /// Cron text in five (Unix), six or seven field form
    Cron(String),
    Repeating(RepeatingInterval),
    /// Lowered to `Repeating` before it is stored
    Relative(RelativeDuration),
}

impl ScheduleExpression {
    pub fn is_cancel(&self) -> bool {
        matches!(self, ScheduleExpression::Cancel)
    }

    /// Replace relative durations with their canonical repeating form
    pub fn lower(self) -> Result<ScheduleExpression, ExpressionError> {
        match self {
            ScheduleExpression::Relative(relative) => {
                Ok(ScheduleExpression::Repeating(relative.to_interval()?))
            }
            other => Ok(other),
        }
    }

    /// Next run time after a previous run at `from`, skipping occurrences at
    /// or before `after`. `None` means the schedule is finished.
    pub fn resolve(
        &self,
        from: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, ExpressionError> {
        self.resolve_at(from, after, Utc::now())
    }

    /// `resolve` with an explicit "now" used for open-ended starts
    pub fn resolve_at(
        &self,
        from: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ExpressionError> {
        match self {
            ScheduleExpression::Cancel => Ok(None),
            ScheduleExpression::Instant(at) => Ok(if from.is_some() { None } else { Some(*at) }),
            ScheduleExpression::Cron(pattern) => crontab::next_cron_at(pattern, from, after, now),
            ScheduleExpression::Repeating(interval) => {
                Ok(interval.next_occurrence(from, after, now))
            }
            ScheduleExpression::Relative(relative) => {
                Ok(relative.to_interval()?.next_occurrence(from, after, now))
            }
        }
    }
}

impl FromStr for ScheduleExpression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();

        if text.is_empty() || text.eq_ignore_ascii_case("cancel") {
            return Ok(ScheduleExpression::Cancel);
        }
        if let Some(instant) = parse_instant(text) {
            return Ok(ScheduleExpression::Instant(instant));
        }
        if text.starts_with('R') {
            return parse_repeating(text).map(ScheduleExpression::Repeating);
        }
        if looks_like_cron(text) {
            parse_cron(text)?;
            return Ok(ScheduleExpression::Cron(text.to_string()));
        }

        Err(ExpressionError::Unrecognized(text.to_string()))
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleExpression::Cancel => f.write_str("cancel"),
            ScheduleExpression::Instant(at) => f.write_str(&format_instant(*at)),
            ScheduleExpression::Cron(pattern) => f.write_str(pattern),
            ScheduleExpression::Repeating(interval) => write!(f, "{interval}"),
            ScheduleExpression::Relative(relative) => match relative.to_interval() {
                Ok(interval) => write!(f, "{interval}"),
                Err(_) => f.write_str("cancel"),
            },
        }
    }
}

impl From<DateTime<Utc>> for ScheduleExpression {
    fn from(instant: DateTime<Utc>) -> Self {
        ScheduleExpression::Instant(instant)
    }
}

impl From<RepeatingInterval> for ScheduleExpression {
    fn from(interval: RepeatingInterval) -> Self {
        ScheduleExpression::Repeating(interval)
    }
}

impl From<RelativeDuration> for ScheduleExpression {
    fn from(relative: RelativeDuration) -> Self {
        ScheduleExpression::Relative(relative)
    }
}

/// Anything that can be turned into a schedule expression
pub trait IntoExpression {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError>;
}

impl IntoExpression for ScheduleExpression {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        Ok(self)
    }
}

impl IntoExpression for &str {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        self.parse()
    }
}

impl IntoExpression for String {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        self.parse()
    }
}

impl IntoExpression for &String {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        self.parse()
    }
}

impl IntoExpression for DateTime<Utc> {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        Ok(ScheduleExpression::Instant(self))
    }
}

impl IntoExpression for RepeatingInterval {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        Ok(ScheduleExpression::Repeating(self))
    }
}

impl IntoExpression for RelativeDuration {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        Ok(ScheduleExpression::Relative(self))
    }
}

impl<T: IntoExpression> IntoExpression for Option<T> {
    fn into_expression(self) -> Result<ScheduleExpression, ExpressionError> {
        match self {
            Some(inner) => inner.into_expression(),
            None => Ok(ScheduleExpression::Cancel),
        }
    }
}

/// Parse any expression form and resolve its next run time
pub fn resolve(
    expression: impl IntoExpression,
    from: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, ExpressionError> {
    expression.into_expression()?.resolve(from, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_instant_forms() {
        assert_eq!(parse_instant("2024-01-01"), Some(date(2024, 1, 1)));
        assert_eq!(parse_instant("2024-01-01T00:00:00Z"), Some(date(2024, 1, 1)));
        assert_eq!(
            parse_instant("2024-01-01T02:00:00+02:00"),
            Some(date(2024, 1, 1))
        );
        assert_eq!(parse_instant("2024-02-30"), None);
        assert_eq!(parse_instant("tomorrow"), None);
    }

    #[test]
    fn test_format_instant_has_millis_and_z() {
        assert_eq!(format_instant(date(2020, 1, 4)), "2020-01-04T00:00:00.000Z");
    }

    #[test]
    fn test_classification() {
        assert_eq!("".parse::<ScheduleExpression>().unwrap(), ScheduleExpression::Cancel);
        assert_eq!("cancel".parse::<ScheduleExpression>().unwrap(), ScheduleExpression::Cancel);
        assert!(matches!(
            "2024-01-01".parse::<ScheduleExpression>().unwrap(),
            ScheduleExpression::Instant(_)
        ));
        assert!(matches!(
            "R/P1D".parse::<ScheduleExpression>().unwrap(),
            ScheduleExpression::Repeating(_)
        ));
        assert!(matches!(
            "*/5 * * * *".parse::<ScheduleExpression>().unwrap(),
            ScheduleExpression::Cron(_)
        ));
    }

    #[test]
    fn test_unrecognized_and_malformed() {
        assert!(matches!(
            "every now and then".parse::<ScheduleExpression>(),
            Err(ExpressionError::Unrecognized(_))
        ));
        assert!(matches!(
            "R/PX".parse::<ScheduleExpression>(),
            Err(ExpressionError::Malformed { .. })
        ));
        assert!(matches!(
            "61 * * * *".parse::<ScheduleExpression>(),
            Err(ExpressionError::Malformed { .. })
        ));
    }

    #[test]
    fn test_resolve_instant() {
        let at = date(2024, 1, 1);
        assert_eq!(resolve(at, None, None).unwrap(), Some(at));
        assert_eq!(resolve(at, Some(at), None).unwrap(), None);
    }

    #[test]
    fn test_resolve_cancel_and_none() {
        assert_eq!(resolve("cancel", None, None).unwrap(), None);
        assert_eq!(resolve(None::<&str>, None, None).unwrap(), None);
    }

    #[test]
    fn test_resolve_repeating_and_cron() {
        assert_eq!(
            resolve("R/P1D", Some(date(2024, 1, 1)), None).unwrap(),
            Some(date(2024, 1, 2))
        );
        assert_eq!(
            resolve("0 0 */1 * *", Some(date(2024, 1, 1)), None).unwrap(),
            Some(date(2024, 1, 2))
        );
    }

    #[test]
    fn test_resolve_relative_is_lowered() {
        let relative = RelativeDuration {
            days: 2,
            ..Default::default()
        };
        assert_eq!(
            resolve(relative, Some(date(2024, 1, 1)), None).unwrap(),
            Some(date(2024, 1, 3))
        );
        assert_eq!(
            resolve(RelativeDuration::default(), None, None),
            Err(ExpressionError::EmptyDuration)
        );
    }

    #[test]
    fn test_display_round_trip() {
        for text in [
            "2024-01-01T10:30:00.000Z",
            "R/P1D",
            "R3/2024-01-01T00:00:00.000Z/PT1H",
            "0 0 * * *",
        ] {
            let expression: ScheduleExpression = text.parse().unwrap();
            assert_eq!(expression.to_string(), text);
            assert_eq!(expression.to_string().parse::<ScheduleExpression>().unwrap(), expression);
        }
    }

    #[test]
    fn test_lower_relative() {
        let lowered = ScheduleExpression::Relative(RelativeDuration {
            hours: 1,
            recurrences: Some(2),
            ..Default::default()
        })
        .lower()
        .unwrap();
        assert_eq!(lowered.to_string(), "R2/PT1H");
    }
}
