// Relative durations
//
// Human phrases such as "every 2 days", "in 10 minutes" or "30s 8 times" are
// lexed into a `RelativeDuration` and lowered to the canonical repeating form.

use super::repeating::{Repeats, RepeatingInterval};
use super::span::CalendarSpan;
use super::format_instant;
use crate::errors::ExpressionError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

static TOKEN_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Structured relative schedule.
///
/// `recurrences = None` repeats forever. `end_date` only applies together with
/// a `start_date`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub recurrences: Option<u32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl RelativeDuration {
    pub fn span(&self) -> CalendarSpan {
        CalendarSpan {
            years: self.years,
            months: self.months,
            weeks: self.weeks,
            days: self.days,
            hours: self.hours,
            minutes: self.minutes,
            seconds: self.seconds,
        }
    }

    /// Lower to the canonical repeating interval
    pub fn to_interval(&self) -> Result<RepeatingInterval, ExpressionError> {
        let span = self.span();
        if span.is_zero() && self.start_date.is_none() {
            return Err(ExpressionError::EmptyDuration);
        }

        Ok(RepeatingInterval {
            repeats: self.recurrences.map_or(Repeats::Infinite, Repeats::Finite),
            start: self.start_date,
            end: self.start_date.and(self.end_date),
            span,
        })
    }
}

/// Render a relative duration as `R[n]/[start/[end/]]P..T..`
pub fn duration_to_iso(duration: &RelativeDuration) -> Result<String, ExpressionError> {
    Ok(duration.to_interval()?.to_string())
}

/// Convert a human phrase to a canonical repeating expression.
///
/// `from` becomes the start of the interval; `in`/`next` phrases without an
/// explicit count become a single run at `from + span`.
pub fn relative_to_iso(text: &str, from: Option<DateTime<Utc>>) -> Result<String, ExpressionError> {
    let lexed = lex(text);
    if lexed.span.is_zero() {
        return Err(ExpressionError::EmptyDuration);
    }

    let leading = text
        .split_whitespace()
        .next()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let recurrences = match leading.as_str() {
        "every" | "each" => lexed.recurrences,
        "in" | "next" if lexed.recurrences.is_none() => {
            let base = from.unwrap_or_else(Utc::now);
            let at = lexed
                .span
                .add_to(base, 1)
                .ok_or_else(|| ExpressionError::malformed(text, "date out of range"))?;
            return Ok(format!("R0/{}/P0S", format_instant(at)));
        }
        _ => Some(lexed.recurrences.unwrap_or(0)),
    };

    let duration = RelativeDuration {
        recurrences,
        start_date: from,
        ..RelativeDuration::from(lexed.span)
    };
    duration_to_iso(&duration)
}

/// Parse a human period such as `15s`, `1 minute` or `500ms` into a
/// `Duration`. Months count as 30 days and years as 365 days.
pub fn parse_period(text: &str) -> Result<Duration, ExpressionError> {
    let lexed = lex(text);
    let span = lexed.span;

    let seconds = u64::from(span.seconds)
        + u64::from(span.minutes) * 60
        + u64::from(span.hours) * 3_600
        + u64::from(span.days) * 86_400
        + u64::from(span.weeks) * 7 * 86_400
        + u64::from(span.months) * 30 * 86_400
        + u64::from(span.years) * 365 * 86_400;

    let period = Duration::from_secs(seconds) + Duration::from_millis(lexed.millis);
    if period.is_zero() {
        return Err(ExpressionError::EmptyDuration);
    }
    Ok(period)
}

/// Render a period the way `parse_period` reads it back (`90s`, `250ms`)
pub fn format_period(period: Duration) -> String {
    if period.subsec_millis() == 0 {
        format!("{}s", period.as_secs())
    } else {
        format!("{}ms", period.as_millis())
    }
}

impl From<CalendarSpan> for RelativeDuration {
    fn from(span: CalendarSpan) -> Self {
        RelativeDuration {
            years: span.years,
            months: span.months,
            weeks: span.weeks,
            days: span.days,
            hours: span.hours,
            minutes: span.minutes,
            seconds: span.seconds,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

#[derive(Debug, Default)]
struct Lexed {
    span: CalendarSpan,
    millis: u64,
    recurrences: Option<u32>,
}

impl Lexed {
    fn add(&mut self, unit: Unit, amount: u32) {
        let slot = match unit {
            Unit::Millis => {
                self.millis = self.millis.saturating_add(u64::from(amount));
                return;
            }
            Unit::Seconds => &mut self.span.seconds,
            Unit::Minutes => &mut self.span.minutes,
            Unit::Hours => &mut self.span.hours,
            Unit::Days => &mut self.span.days,
            Unit::Weeks => &mut self.span.weeks,
            Unit::Months => &mut self.span.months,
            Unit::Years => &mut self.span.years,
        };
        *slot = slot.saturating_add(amount);
    }
}

fn lex(text: &str) -> Lexed {
    let pattern = TOKEN_PATTERN
        .get_or_init(|| Regex::new(r"(\d+)?\s*([a-zA-Z]+)").expect("Invalid token regex"));

    let mut lexed = Lexed::default();
    let mut implied_one = false;

    for caps in pattern.captures_iter(text) {
        let word = &caps[2];

        let Some(amount) = caps.get(1) else {
            if is_article(word) {
                implied_one = true;
                continue;
            }
            if implied_one {
                if let Some(unit) = lookup_unit(word) {
                    lexed.add(unit, 1);
                }
            }
            implied_one = false;
            continue;
        };
        implied_one = false;

        // Amounts that overflow are ignored like any other unreadable token
        let Ok(amount) = amount.as_str().parse::<u32>() else {
            continue;
        };

        if word.eq_ignore_ascii_case("time") || word.eq_ignore_ascii_case("times") {
            lexed.recurrences = Some(amount);
        } else if let Some(unit) = lookup_unit(word) {
            lexed.add(unit, amount);
        }
    }

    lexed
}

fn is_article(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "a" | "an" | "next" | "every" | "each"
    )
}

fn lookup_unit(word: &str) -> Option<Unit> {
    // `M` is months, every other spelling is case-insensitive
    if word == "M" {
        return Some(Unit::Months);
    }

    let unit = match word.to_ascii_lowercase().as_str() {
        "ms" | "msec" | "msecs" | "milli" | "millis" | "millisecond" | "milliseconds" => {
            Unit::Millis
        }
        "s" | "sec" | "secs" | "second" | "seconds" => Unit::Seconds,
        "m" | "min" | "mins" | "minute" | "minutes" | "moment" | "moments" => Unit::Minutes,
        "h" | "hr" | "hrs" | "hour" | "hours" => Unit::Hours,
        "d" | "day" | "days" => Unit::Days,
        "w" | "wk" | "wks" | "week" | "weeks" => Unit::Weeks,
        "mo" | "mos" | "month" | "months" => Unit::Months,
        "y" | "yr" | "yrs" | "year" | "years" => Unit::Years,
        _ => return None,
    };
    Some(unit)
}
