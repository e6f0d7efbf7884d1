//! Record normalizer: raw source record -> canonical row
//!
//! Pure projection, no I/O. Identifier and timestamp rules:
//!
//! - the identifier must be a non-blank string or an integer
//! - numeric timestamps below [`EPOCH_MILLIS_THRESHOLD`] are epoch seconds,
//!   everything at or above it is epoch milliseconds
//! - string timestamps are RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.fff]`
//!   (with `T` or space) taken as UTC
//! - a missing or `null` timestamp yields no `occurred_at`; anything present
//!   that does not parse fails the record

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::types::{CanonicalRow, RawRecord};

/// Numeric timestamps at or above this magnitude are read as milliseconds.
///
/// 10^11 seconds is roughly the year 5138; 10^11 milliseconds is March 1973.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Names of the source fields the normalizer reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id_field: String,
    pub category_field: String,
    pub timestamp_field: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            category_field: "type".to_string(),
            timestamp_field: "timestamp".to_string(),
        }
    }
}

/// Projects raw records into canonical rows
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    fields: FieldMapping,
}

impl Normalizer {
    pub fn new(fields: FieldMapping) -> Self {
        Self { fields }
    }

    /// Normalize one record
    pub fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRow> {
        let id = self.identifier(raw)?;
        let category = self.category(raw)?;
        let occurred_at = match raw.get(&self.fields.timestamp_field) {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_timestamp(value).map_err(|reason| {
                IngestError::validation(format!(
                    "record '{id}': field '{}' {reason}",
                    self.fields.timestamp_field
                ))
            })?),
        };

        Ok(CanonicalRow::new(
            id,
            category,
            occurred_at,
            Value::Object(raw.clone()),
        ))
    }

    /// Normalize a page, failing on the first bad record
    pub fn normalize_all(&self, raws: &[RawRecord]) -> Result<Vec<CanonicalRow>> {
        raws.iter()
            .enumerate()
            .map(|(index, raw)| {
                self.normalize(raw).map_err(|e| match e {
                    IngestError::Validation(msg) => {
                        IngestError::validation(format!("record #{index} of page: {msg}"))
                    },
                    other => other,
                })
            })
            .collect()
    }

    fn identifier(&self, raw: &RawRecord) -> Result<String> {
        let field = &self.fields.id_field;
        match raw.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            Some(Value::String(_)) => Err(IngestError::validation(format!(
                "identifier field '{field}' is empty"
            ))),
            None | Some(Value::Null) => Err(IngestError::validation(format!(
                "missing identifier field '{field}'"
            ))),
            Some(other) => Err(IngestError::validation(format!(
                "identifier field '{field}' has unsupported type {}",
                json_type(other)
            ))),
        }
    }

    fn category(&self, raw: &RawRecord) -> Result<Option<String>> {
        let field = &self.fields.category_field;
        match raw.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(IngestError::validation(format!(
                "category field '{field}' has unsupported type {}",
                json_type(other)
            ))),
        }
    }
}

/// Parse a timestamp value; the error is a short reason phrase
fn parse_timestamp(value: &Value) -> std::result::Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => {
            let instant = if let Some(whole) = n.as_i64() {
                from_epoch_integer(whole)
            } else {
                n.as_f64().and_then(from_epoch_float)
            };
            instant.ok_or_else(|| format!("holds out-of-range epoch value {n}"))
        },
        Value::String(s) => parse_datetime_str(s.trim())
            .ok_or_else(|| format!("holds unparseable date-time '{s}'")),
        other => Err(format!("has unsupported type {}", json_type(other))),
    }
}

fn from_epoch_integer(value: i64) -> Option<DateTime<Utc>> {
    if (value.unsigned_abs() as f64) >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn from_epoch_float(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let micros = if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        value * 1_000.0
    } else {
        value * 1_000_000.0
    };
    if micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros.round() as i64)
}

fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
