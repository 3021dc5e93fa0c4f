// SQL template formatter
//
// Renders query templates with positional `$n` placeholders into plain SQL
// text. Modifiers:
//   `$n:name`  quoted identifier, optionally schema-qualified
//   `$n:csv`   list rendered as comma separated literals (`:list` is an alias)
//   `$n:json`  JSON text literal
//   `$n:line`  keeps the rest of the line only when the parameter is truthy
//
// Placeholders inside string literals of the template are not detected, so
// templates must not embed `$n` in quotes.

use crate::errors::FormatError;
use crate::expression::format_instant;
use crate::store::TableRef;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use std::sync::OnceLock;
use tracing::instrument;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
static LINE_PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

/// A value bound to a `$n` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    List(Vec<SqlParam>),
    Json(serde_json::Value),
    Table(TableRef),
}

impl SqlParam {
    /// `:line` truthiness: NULL, false, zero and empty text are falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            SqlParam::Null => false,
            SqlParam::Bool(b) => *b,
            SqlParam::Int(n) => *n != 0,
            SqlParam::Text(s) => !s.is_empty(),
            SqlParam::Json(value) => !value.is_null(),
            SqlParam::Timestamp(_) | SqlParam::List(_) | SqlParam::Table(_) => true,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            SqlParam::Null => serde_json::Value::Null,
            SqlParam::Bool(b) => serde_json::Value::Bool(*b),
            SqlParam::Int(n) => serde_json::Value::from(*n),
            SqlParam::Text(s) => serde_json::Value::String(s.clone()),
            SqlParam::Timestamp(t) => serde_json::Value::String(format_instant(*t)),
            SqlParam::List(items) => items.iter().map(SqlParam::to_json).collect(),
            SqlParam::Json(value) => value.clone(),
            SqlParam::Table(table) => serde_json::Value::String(table.table.clone()),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<&String> for SqlParam {
    fn from(value: &String) -> Self {
        SqlParam::Text(value.clone())
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Int(i64::from(value))
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<usize> for SqlParam {
    fn from(value: usize) -> Self {
        SqlParam::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(value: DateTime<Utc>) -> Self {
        SqlParam::Timestamp(value)
    }
}

impl From<serde_json::Value> for SqlParam {
    fn from(value: serde_json::Value) -> Self {
        SqlParam::Json(value)
    }
}

impl From<&serde_json::Value> for SqlParam {
    fn from(value: &serde_json::Value) -> Self {
        SqlParam::Json(value.clone())
    }
}

impl From<TableRef> for SqlParam {
    fn from(value: TableRef) -> Self {
        SqlParam::Table(value)
    }
}

impl From<&TableRef> for SqlParam {
    fn from(value: &TableRef) -> Self {
        SqlParam::Table(value.clone())
    }
}

impl From<&[String]> for SqlParam {
    fn from(values: &[String]) -> Self {
        SqlParam::List(values.iter().map(SqlParam::from).collect())
    }
}

impl From<Vec<String>> for SqlParam {
    fn from(values: Vec<String>) -> Self {
        SqlParam::List(values.into_iter().map(SqlParam::Text).collect())
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlParam::Null, Into::into)
    }
}

/// Render `template` with `params` bound to `$1..$n`
#[instrument(skip_all, fields(template_len = template.len(), params = params.len()))]
pub fn format_sql(template: &str, params: &[SqlParam]) -> Result<String, FormatError> {
    let template = apply_line_modifiers(template, params)?;

    let pattern = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$(\d+)(?::(\w+))?").expect("Invalid placeholder regex"));

    let mut sql = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(&template) {
        let Some(whole) = caps.get(0) else { continue };
        sql.push_str(&template[last..whole.start()]);
        sql.push_str(&render_placeholder(&caps, params)?);
        last = whole.end();
    }
    sql.push_str(&template[last..]);

    Ok(sql)
}

fn apply_line_modifiers(template: &str, params: &[SqlParam]) -> Result<String, FormatError> {
    let pattern = LINE_PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$(\d+):line(.*)").expect("Invalid line placeholder regex"));

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        let (_, param) = lookup(&caps[1], params)?;
        out.push_str(&template[last..whole.start()]);
        if param.is_truthy() {
            out.push_str(&caps[2]);
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(out)
}

fn lookup<'a>(index: &str, params: &'a [SqlParam]) -> Result<(usize, &'a SqlParam), FormatError> {
    let position: usize = index
        .parse()
        .map_err(|_| FormatError::InvalidIndex(format!("${index}")))?;
    position
        .checked_sub(1)
        .and_then(|i| params.get(i))
        .map(|param| (position, param))
        .ok_or_else(|| FormatError::InvalidIndex(format!("${index}")))
}

fn render_placeholder(caps: &Captures<'_>, params: &[SqlParam]) -> Result<String, FormatError> {
    let (position, param) = lookup(&caps[1], params)?;
    let modifier = caps.get(2).map(|m| m.as_str());

    match modifier {
        Some("name") => table_name(param),
        Some("csv") | Some("list") => match param {
            SqlParam::List(items) => items
                .iter()
                .map(|item| literal(item, position))
                .collect::<Result<Vec<_>, _>>()
                .map(|items| items.join(", ")),
            other => literal(other, position),
        },
        Some("json") => Ok(quote_text(&param.to_json().to_string())),
        _ => literal(param, position),
    }
}

fn literal(param: &SqlParam, position: usize) -> Result<String, FormatError> {
    match param {
        SqlParam::Null => Ok("NULL".to_string()),
        SqlParam::Bool(b) => Ok(b.to_string()),
        SqlParam::Int(n) => Ok(n.to_string()),
        SqlParam::Text(s) => Ok(quote_text(s)),
        SqlParam::Timestamp(t) => Ok(quote_text(&format_instant(*t))),
        SqlParam::List(_) => Err(FormatError::ListWithoutCsv(position)),
        SqlParam::Json(value) => match value {
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                Err(FormatError::ObjectWithoutJson(position))
            }
            serde_json::Value::Null => Ok("NULL".to_string()),
            serde_json::Value::String(s) => Ok(quote_text(s)),
            scalar => Ok(scalar.to_string()),
        },
        SqlParam::Table(table) => table_ref_name(table),
    }
}

/// Single-quoted SQL string literal
pub fn quote_text(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Double-quoted identifier; quote characters are rejected
pub fn quote_ident(name: &str) -> Result<String, FormatError> {
    if name.is_empty() || name.contains(['"', '`', '\'']) {
        return Err(FormatError::InvalidTableName(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

/// Quoted, optionally schema-qualified table name
pub fn table_ref_name(table: &TableRef) -> Result<String, FormatError> {
    let name = quote_ident(&table.table)?;
    match table.schema.as_deref().filter(|schema| !schema.is_empty()) {
        Some(schema) => Ok(format!("{}.{name}", quote_ident(schema)?)),
        None => Ok(name),
    }
}

fn table_name(param: &SqlParam) -> Result<String, FormatError> {
    match param {
        SqlParam::Table(table) => table_ref_name(table),
        SqlParam::Text(name) => name
            .split('.')
            .map(quote_ident)
            .collect::<Result<Vec<_>, _>>()
            .map(|parts| parts.join(".")),
        other => Err(FormatError::InvalidTableName(format!("{other:?}"))),
    }
}
