// Cron expressions
// Unix five-field normalization and UTC next-occurrence lookup on top of the `cron` crate

use crate::errors::ExpressionError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use regex::Regex;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::OnceLock;

static CRON_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Whether `text` has the shape of a cron expression (5 to 7 fields)
pub fn looks_like_cron(text: &str) -> bool {
    let pattern = CRON_PATTERN.get_or_init(|| {
        Regex::new(
            r"^((((\d+,)+\d+|(\d+(/|-|#)\d+)|\d+L?|\*(/\d+)?|L(-\d+)?|\?|[A-Z]{3}(-[A-Z]{3})?) ?){5,7})$",
        )
        .expect("Invalid cron pattern regex")
    });
    pattern.is_match(text.trim())
}

/// Parse a cron expression, accepting Unix five-field syntax.
///
/// Five-field expressions get a `0` seconds field. Day-of-week values are
/// moved from Unix numbering (0 or 7 = Sunday) to 1 = Sunday for every form.
pub fn parse_cron(expression: &str) -> Result<Schedule, ExpressionError> {
    let normalized = normalize_fields(expression);
    Schedule::from_str(&normalized)
        .map_err(|e| ExpressionError::malformed(expression, e.to_string()))
}

/// Next occurrence of a cron schedule strictly after `max(from, after)`.
///
/// Without `from` the job is due immediately, so the current time is returned.
pub fn next_cron(
    expression: &str,
    from: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, ExpressionError> {
    next_cron_at(expression, from, after, Utc::now())
}

pub(crate) fn next_cron_at(
    expression: &str,
    from: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ExpressionError> {
    let schedule = parse_cron(expression)?;

    let Some(from) = from else {
        return Ok(Some(now));
    };

    let reference = match after {
        Some(after) if after > from => after,
        _ => from,
    };

    Ok(schedule.after(&reference).next())
}

fn normalize_fields(expression: &str) -> String {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => {
            fields[4] = translate_weekdays(&fields[4]);
            fields.insert(0, "0".to_string());
        }
        6 | 7 => fields[5] = translate_weekdays(&fields[5]),
        _ => {}
    }
    fields.join(" ")
}

fn translate_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(translate_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn translate_weekday_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (range, Some(step)),
            _ => return item.to_string(),
        },
        None => (item, None),
    };

    let bounds = match range.split_once('-') {
        Some((low, high)) => unix_weekday(low).zip(unix_weekday(high)),
        // `1/2` steps from 1 up to the end of the week
        None if step.is_some() => unix_weekday(range).map(|low| (low, 7)),
        None => return shift_leading_weekday(range),
    };

    let Some((low, high)) = bounds.filter(|(low, high)| low <= high) else {
        return item.to_string();
    };

    match step {
        None if high < 7 => format!("{}-{}", low + 1, high + 1),
        _ => {
            let days: BTreeSet<u8> = (low..=high)
                .step_by(step.unwrap_or(1))
                .map(|day| if day == 7 { 1 } else { day + 1 })
                .collect();
            days.iter().map(u8::to_string).collect::<Vec<_>>().join(",")
        }
    }
}

fn unix_weekday(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|day| *day <= 7)
}

// Handles plain days and suffixed forms such as `5L` or `1#2`
fn shift_leading_weekday(value: &str) -> String {
    let digits = value.chars().take_while(char::is_ascii_digit).count();
    let (number, suffix) = value.split_at(digits);
    match shift_weekday(number) {
        Some(day) => format!("{day}{suffix}"),
        None => value.to_string(),
    }
}

fn shift_weekday(value: &str) -> Option<u8> {
    match value.parse::<u8>().ok()? {
        7 => Some(1),
        day if day < 7 => Some(day + 1),
        _ => None,
    }
}
