//! Free-form metadata documents and how dates inside them are decoded.
//!
//! Dates are stored in the extended form `{"$date": <epoch millis>}`. Each
//! read call carries its own [`DecodeOptions`]; nothing about decoding is
//! registered globally.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object attached to a file record.
pub type Document = Map<String, Value>;

const DATE_KEY: &str = "$date";

/// How `{"$date": ..}` values in metadata are handed back to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateDecoding {
    /// Leave dates in their stored `{"$date": millis}` form.
    #[default]
    Extended,
    /// Replace dates with RFC 3339 strings.
    Rfc3339,
}

/// Per-call decoding configuration for reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
    pub dates: DateDecoding,
}

impl DecodeOptions {
    pub fn rfc3339() -> Self {
        Self {
            dates: DateDecoding::Rfc3339,
        }
    }
}

/// Encode a timestamp the way metadata stores it.
pub fn date_value(date: DateTime<Utc>) -> Value {
    let mut map = Map::new();
    map.insert(DATE_KEY.to_string(), Value::from(date.timestamp_millis()));
    Value::Object(map)
}

/// Read a date from `value`, accepting either the extended form or an
/// RFC 3339 string.
pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) if map.len() == 1 => map
            .get(DATE_KEY)
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

pub(crate) fn decode_document(doc: Document, options: &DecodeOptions) -> Document {
    match options.dates {
        DateDecoding::Extended => doc,
        DateDecoding::Rfc3339 => doc
            .into_iter()
            .map(|(key, value)| (key, decode_value(value)))
            .collect(),
    }
}

fn decode_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(date) = map
                    .get(DATE_KEY)
                    .and_then(Value::as_i64)
                    .and_then(DateTime::from_timestamp_millis)
                {
                    return Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true));
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, decode_value(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(decode_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        let when = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let value = json!({
            "owner": "ana",
            "created": date_value(when),
            "history": [{ "at": date_value(when) }],
        });
        value.as_object().unwrap().clone()
    }

    #[test]
    fn extended_leaves_dates_untouched() {
        let doc = decode_document(sample(), &DecodeOptions::default());
        assert_eq!(doc["created"], json!({ "$date": 1_700_000_000_123i64 }));
    }

    #[test]
    fn rfc3339_rewrites_nested_dates() {
        let doc = decode_document(sample(), &DecodeOptions::rfc3339());
        assert_eq!(doc["created"], json!("2023-11-14T22:13:20.123Z"));
        assert_eq!(doc["history"][0]["at"], json!("2023-11-14T22:13:20.123Z"));
        assert_eq!(doc["owner"], json!("ana"));
    }

    #[test]
    fn as_date_reads_both_forms() {
        let when = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(as_date(&date_value(when)), Some(when));
        assert_eq!(as_date(&json!("2023-11-14T22:13:20.123Z")), Some(when));
        assert_eq!(as_date(&json!({ "$date": "x", "other": 1 })), None);
    }
}
