// Repeating ISO-8601 intervals
// `R[n]/[start/[end/]]duration` parsing, rendering and next-occurrence computation

use super::span::CalendarSpan;
use super::{format_instant, parse_instant};
use crate::errors::ExpressionError;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::str::FromStr;

/// Number of repetitions of a repeating interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repeats {
    Finite(u32),
    Infinite,
}

impl Repeats {
    fn parse(segment: &str, expression: &str) -> Result<Self, ExpressionError> {
        let count = segment
            .strip_prefix('R')
            .ok_or_else(|| ExpressionError::malformed(expression, "must start with 'R'"))?;

        if count.is_empty() {
            return Ok(Repeats::Infinite);
        }

        let count: i64 = count
            .parse()
            .map_err(|_| ExpressionError::malformed(expression, "repeat count is not a number"))?;

        if count < 0 {
            return Ok(Repeats::Infinite);
        }

        u32::try_from(count)
            .map(Repeats::Finite)
            .map_err(|_| ExpressionError::malformed(expression, "repeat count out of range"))
    }
}

impl fmt::Display for Repeats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repeats::Finite(n) => write!(f, "{n}"),
            Repeats::Infinite => Ok(()),
        }
    }
}

/// Canonical recurring schedule.
///
/// `start = None` means "now at evaluation time". An explicit `end` is only
/// rendered when a `start` is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepeatingInterval {
    pub repeats: Repeats,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub span: CalendarSpan,
}

impl RepeatingInterval {
    pub fn new(repeats: Repeats, span: CalendarSpan) -> Self {
        Self {
            repeats,
            start: None,
            end: None,
            span,
        }
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn effective_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.start.unwrap_or(now)
    }

    /// Explicit end, or `start + span * repeats` for finite repeats.
    /// `None` means unbounded.
    pub fn effective_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.end.is_some() {
            return self.end;
        }
        match self.repeats {
            Repeats::Finite(n) => self.span.add_to(self.effective_start(now), n),
            Repeats::Infinite => None,
        }
    }

    /// Next occurrence after a previous run at `from`, skipping everything at
    /// or before `after`.
    ///
    /// Without `from` the effective start is returned. `None` means the
    /// interval is exhausted.
    pub fn next_occurrence(
        &self,
        from: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let Some(from) = from else {
            return Some(self.effective_start(now));
        };

        if self.repeats == Repeats::Finite(0) || self.span.is_zero() {
            return None;
        }

        let end = self.effective_end(now);
        let next = if self.span.has_calendar_units() {
            self.step_calendar(from, after, end)?
        } else {
            self.step_fixed(from, after)?
        };

        match end {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    fn step_calendar(
        &self,
        from: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let mut next = from;
        loop {
            next = self.span.add_to(next, 1)?;
            if end.is_some_and(|end| next > end) {
                return None;
            }
            match after {
                Some(after) if next <= after => continue,
                _ => return Some(next),
            }
        }
    }

    // Fixed-length spans jump straight to the first multiple past `after`
    fn step_fixed(&self, from: DateTime<Utc>, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let step_ms = self.span.fixed_seconds().checked_mul(1_000)?;

        let steps = match after {
            Some(after) if after >= from => (after - from).num_milliseconds() / step_ms + 1,
            _ => 1,
        };

        from.checked_add_signed(TimeDelta::try_milliseconds(steps.checked_mul(step_ms)?)?)
    }
}

impl FromStr for RepeatingInterval {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_repeating(s)
    }
}

/// Parse `R[n]/duration`, `R[n]/start/duration` or `R[n]/start/end/duration`
pub fn parse_repeating(expression: &str) -> Result<RepeatingInterval, ExpressionError> {
    let segments: Vec<&str> = expression.trim().split('/').collect();

    let instant = |text: &str| {
        parse_instant(text)
            .ok_or_else(|| ExpressionError::malformed(expression, format!("invalid date '{text}'")))
    };

    let repeats = Repeats::parse(segments[0], expression)?;

    let (start, end, span) = match segments.as_slice() {
        [_, span] => (None, None, *span),
        [_, start, span] => (Some(instant(start)?), None, *span),
        [_, start, end, span] => (Some(instant(start)?), Some(instant(end)?), *span),
        [_] => return Err(ExpressionError::malformed(expression, "missing duration")),
        _ => return Err(ExpressionError::malformed(expression, "too many segments")),
    };

    let span: CalendarSpan = span
        .parse()
        .map_err(|_| ExpressionError::malformed(expression, format!("invalid duration '{span}'")))?;

    Ok(RepeatingInterval {
        repeats,
        start,
        end,
        span,
    })
}

impl fmt::Display for RepeatingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}/", self.repeats)?;
        if let Some(start) = self.start {
            write!(f, "{}/", format_instant(start))?;
            if let Some(end) = self.end {
                write!(f, "{}/", format_instant(end))?;
            }
        }
        write!(f, "{}", self.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn next(expr: &str, from: Option<DateTime<Utc>>, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        parse_repeating(expr)
            .unwrap()
            .next_occurrence(from, after, date(2030, 6, 1))
    }

    #[test]
    fn test_parse_two_segments() {
        let interval = parse_repeating("R/P1D").unwrap();
        assert_eq!(interval.repeats, Repeats::Infinite);
        assert_eq!(interval.start, None);
        assert_eq!(interval.span.days, 1);
    }

    #[test]
    fn test_parse_three_and_four_segments() {
        let interval = parse_repeating("R5/2024-01-01/P1D").unwrap();
        assert_eq!(interval.repeats, Repeats::Finite(5));
        assert_eq!(interval.start, Some(date(2024, 1, 1)));

        let interval = parse_repeating("R/2024-01-01/2025-01-01/P2M").unwrap();
        assert_eq!(interval.end, Some(date(2025, 1, 1)));
        assert_eq!(interval.span.months, 2);
    }

    #[test]
    fn test_negative_repeats_are_infinite() {
        assert_eq!(parse_repeating("R-1/P1D").unwrap().repeats, Repeats::Infinite);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for expr in [
            "P1D",
            "R",
            "Rx/P1D",
            "R/invalid",
            "R/2024-13-45/P1D",
            "R/2024-01-01/2024-02-01/2024-03-01/P1D",
        ] {
            assert!(
                matches!(parse_repeating(expr), Err(ExpressionError::Malformed { .. })),
                "{expr} should be malformed"
            );
        }
    }

    #[test]
    fn test_effective_end_from_finite_repeats() {
        let interval = parse_repeating("R4/2024-01-01/P1D").unwrap();
        assert_eq!(interval.effective_end(date(2030, 1, 1)), Some(date(2024, 1, 5)));
    }

    #[test]
    fn test_next_without_from_returns_start() {
        assert_eq!(next("R5/2024-01-01/P1D", None, None), Some(date(2024, 1, 1)));
        assert_eq!(next("R0/2024-01-01/P0S", None, None), Some(date(2024, 1, 1)));
    }

    #[test]
    fn test_next_without_start_is_now() {
        assert_eq!(next("R/P1D", None, None), Some(date(2030, 6, 1)));
    }

    #[test]
    fn test_next_one_step() {
        assert_eq!(next("R/P1D", Some(date(2024, 1, 1)), None), Some(date(2024, 1, 2)));
        assert_eq!(
            next("R1/2024-01-01/P1D", Some(date(2024, 1, 1)), None),
            Some(date(2024, 1, 2))
        );
        assert_eq!(next("R1/2024-01-01/P1D", Some(date(2024, 1, 2)), None), None);
    }

    #[test]
    fn test_next_zero_repeats_never_runs_again() {
        assert_eq!(next("R0/2024-01-01/P1D", Some(date(2024, 1, 1)), None), None);
    }

    #[test]
    fn test_next_skips_past() {
        assert_eq!(
            next("R/P1D", Some(date(2024, 1, 1)), Some(date(2024, 4, 5))),
            Some(date(2024, 4, 6))
        );
    }

    #[test]
    fn test_next_exhausted_by_explicit_end() {
        assert_eq!(
            next("R/2024-01-01/2024-01-02/P1D", Some(date(2024, 1, 1)), Some(date(2024, 4, 4))),
            None
        );
        assert_eq!(
            next("R/2024-01-01/2025-01-01/P2M", Some(date(2024, 12, 1)), None),
            None
        );
    }

    #[test]
    fn test_next_exhausted_by_repeat_count() {
        assert_eq!(next("R4/2024-01-01/P1D", Some(date(2024, 1, 5)), None), None);
    }

    #[test]
    fn test_next_monthly_catch_up() {
        assert_eq!(
            next("R/P1M", Some(date(2020, 1, 31)), Some(date(2020, 6, 15))),
            Some(date(2020, 6, 29))
        );
    }

    #[test]
    fn test_zero_span_with_from_yields_none() {
        assert_eq!(next("R/2024-01-01/P0S", Some(date(2024, 1, 1)), None), None);
    }

    #[test]
    fn test_display_canonical_forms() {
        for expr in [
            "R/P1D",
            "R5/PT10S",
            "R0/2020-01-04T00:00:00.000Z/P0S",
            "R/2024-01-01T00:00:00.000Z/2025-01-01T00:00:00.000Z/P2M",
        ] {
            assert_eq!(parse_repeating(expr).unwrap().to_string(), expr);
        }
    }

    #[test]
    fn test_display_normalizes_date_only_start() {
        let interval = parse_repeating("R3/2024-01-01/P1W").unwrap();
        assert_eq!(interval.to_string(), "R3/2024-01-01T00:00:00.000Z/P1W");
    }
}
