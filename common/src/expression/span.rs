// ISO-8601 calendar spans
//
// Parsing, rendering and calendar-aware addition of the `P..T..` duration part
// used by repeating interval expressions.

use crate::errors::ExpressionError;
use chrono::{DateTime, Days, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A calendar span such as `P1Y2M`, `P1W` or `PT10H30M`.
///
/// Fields are applied in the order years, months, weeks, days, hours, minutes,
/// seconds. Years and months are calendar units (their length depends on the
/// date they are added to); everything else is a fixed number of seconds in UTC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarSpan {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl CalendarSpan {
    pub fn is_zero(&self) -> bool {
        *self == CalendarSpan::default()
    }

    /// Whether the span contains units whose length varies with the calendar
    pub fn has_calendar_units(&self) -> bool {
        self.years > 0 || self.months > 0
    }

    /// Length of the fixed (week and smaller) part of the span, in seconds
    pub fn fixed_seconds(&self) -> i64 {
        i64::from(self.weeks) * 7 * 86_400
            + i64::from(self.days) * 86_400
            + i64::from(self.hours) * 3_600
            + i64::from(self.minutes) * 60
            + i64::from(self.seconds)
    }

    /// Add this span, scaled by `multiplier`, to an instant.
    ///
    /// Month arithmetic clamps to the last day of the target month
    /// (Jan 31 + 1 month = Feb 28/29). Returns `None` on overflow.
    pub fn add_to(&self, instant: DateTime<Utc>, multiplier: u32) -> Option<DateTime<Utc>> {
        let mut result = instant;

        if self.years > 0 {
            let months = self.years.checked_mul(12)?.checked_mul(multiplier)?;
            result = result.checked_add_months(Months::new(months))?;
        }
        if self.months > 0 {
            result = result.checked_add_months(Months::new(self.months.checked_mul(multiplier)?))?;
        }
        if self.weeks > 0 {
            let days = u64::from(self.weeks) * 7 * u64::from(multiplier);
            result = result.checked_add_days(Days::new(days))?;
        }
        if self.days > 0 {
            let days = u64::from(self.days) * u64::from(multiplier);
            result = result.checked_add_days(Days::new(days))?;
        }

        let seconds = (i64::from(self.hours) * 3_600
            + i64::from(self.minutes) * 60
            + i64::from(self.seconds))
        .checked_mul(i64::from(multiplier))?;
        if seconds > 0 {
            result = result.checked_add_signed(TimeDelta::try_seconds(seconds)?)?;
        }

        Some(result)
    }
}

impl FromStr for CalendarSpan {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ExpressionError::malformed(s, reason);

        let body = s
            .strip_prefix('P')
            .ok_or_else(|| malformed("duration must start with 'P'"))?;
        if body.is_empty() {
            return Err(malformed("duration has no fields"));
        }

        let mut span = CalendarSpan::default();
        let mut in_time = false;
        let mut number = String::new();
        let mut fields = 0;

        for c in body.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            if c == 'T' {
                if in_time || !number.is_empty() {
                    return Err(malformed("unexpected 'T'"));
                }
                in_time = true;
                continue;
            }
            if number.is_empty() {
                return Err(malformed("designator without a value"));
            }
            let value: u32 = number
                .parse()
                .map_err(|_| malformed("field value out of range"))?;
            number.clear();

            // H and S are unambiguous, so they are accepted before the T too (P0S)
            let slot = match (in_time, c) {
                (false, 'Y') => &mut span.years,
                (false, 'M') => &mut span.months,
                (false, 'W') => &mut span.weeks,
                (false, 'D') => &mut span.days,
                (_, 'H') => &mut span.hours,
                (true, 'M') => &mut span.minutes,
                (_, 'S') => &mut span.seconds,
                _ => return Err(malformed("unknown designator")),
            };
            *slot = value;
            fields += 1;
        }

        if !number.is_empty() {
            return Err(malformed("trailing value without a designator"));
        }
        if fields == 0 {
            return Err(malformed("duration has no fields"));
        }

        Ok(span)
    }
}

impl fmt::Display for CalendarSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("P0S");
        }

        f.write_str("P")?;
        for (value, designator) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if value > 0 {
                write!(f, "{value}{designator}")?;
            }
        }

        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 {
            f.write_str("T")?;
            for (value, designator) in [
                (self.hours, 'H'),
                (self.minutes, 'M'),
                (self.seconds, 'S'),
            ] {
                if value > 0 {
                    write!(f, "{value}{designator}")?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_date_and_time_fields() {
        let span: CalendarSpan = "P1Y2M3W4DT5H6M7S".parse().unwrap();
        assert_eq!(
            span,
            CalendarSpan {
                years: 1,
                months: 2,
                weeks: 3,
                days: 4,
                hours: 5,
                minutes: 6,
                seconds: 7,
            }
        );
    }

    #[test]
    fn test_minutes_versus_months() {
        let months: CalendarSpan = "P5M".parse().unwrap();
        let minutes: CalendarSpan = "PT5M".parse().unwrap();
        assert_eq!(months.months, 5);
        assert_eq!(minutes.minutes, 5);
    }

    #[test]
    fn test_zero_span_forms() {
        assert!("P0S".parse::<CalendarSpan>().unwrap().is_zero());
        assert!("PT0S".parse::<CalendarSpan>().unwrap().is_zero());
        assert_eq!(CalendarSpan::default().to_string(), "P0S");
    }

    #[test]
    fn test_invalid_spans() {
        for text in ["", "P", "PT", "1D", "P1X", "PD", "P1", "invalid", "P1DT"] {
            assert!(text.parse::<CalendarSpan>().is_err(), "{text} should fail");
        }
    }

    #[test]
    fn test_display_omits_zero_fields() {
        let span = CalendarSpan {
            days: 1,
            hours: 1,
            seconds: 30,
            ..Default::default()
        };
        assert_eq!(span.to_string(), "P1DT1H30S");

        let weekly = CalendarSpan {
            weeks: 1,
            ..Default::default()
        };
        assert_eq!(weekly.to_string(), "P1W");
    }

    #[test]
    fn test_add_day_and_month() {
        let day = CalendarSpan {
            days: 1,
            ..Default::default()
        };
        assert_eq!(day.add_to(date(2020, 1, 1), 1), Some(date(2020, 1, 2)));

        let month = CalendarSpan {
            months: 1,
            ..Default::default()
        };
        assert_eq!(month.add_to(date(2020, 1, 1), 1), Some(date(2020, 2, 1)));
    }

    #[test]
    fn test_add_every_field() {
        let span = CalendarSpan {
            years: 1,
            months: 1,
            weeks: 1,
            days: 1,
            hours: 1,
            minutes: 1,
            seconds: 30,
        };
        let expected = Utc.with_ymd_and_hms(2021, 2, 9, 1, 1, 30).unwrap();
        assert_eq!(span.add_to(date(2020, 1, 1), 1), Some(expected));
    }

    #[test]
    fn test_add_with_multiplier() {
        let span = CalendarSpan {
            days: 3,
            ..Default::default()
        };
        assert_eq!(span.add_to(date(2024, 1, 1), 3), Some(date(2024, 1, 10)));
    }

    #[test]
    fn test_month_end_clamps() {
        let month = CalendarSpan {
            months: 1,
            ..Default::default()
        };
        assert_eq!(month.add_to(date(2024, 1, 31), 1), Some(date(2024, 2, 29)));
    }
}
