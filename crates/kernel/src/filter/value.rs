//! Helpers for interpreting JSON filter values.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parse an ISO-8601 style date or datetime string.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Runtime type of a filter value, as far as field selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Numeric,
    DateTime,
    Text,
}

impl ValueType {
    /// Classify a value. Lists are classified by their first element.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(_) => ValueType::Numeric,
            Value::String(s) if parse_datetime(s).is_some() => ValueType::DateTime,
            Value::Array(items) => items.first().map_or(ValueType::Text, ValueType::of),
            _ => ValueType::Text,
        }
    }
}

/// String form of a value: strings as-is, everything else as JSON text.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_common_datetime_shapes() {
        assert!(parse_datetime("2021-03-04").is_some());
        assert!(parse_datetime("2021-03-04 10:11:12").is_some());
        assert!(parse_datetime("2021-03-04T10:11:12.500").is_some());
        assert!(parse_datetime("2021-03-04T10:11:12Z").is_some());
        assert!(parse_datetime("2021-03-04T10:11:12+02:00").is_some());
        assert!(parse_datetime("dog").is_none());
        assert!(parse_datetime("2021").is_none());
    }

    #[test]
    fn classifies_values() {
        assert_eq!(ValueType::of(&json!(3)), ValueType::Numeric);
        assert_eq!(ValueType::of(&json!(2.5)), ValueType::Numeric);
        assert_eq!(ValueType::of(&json!("2020-01-01")), ValueType::DateTime);
        assert_eq!(ValueType::of(&json!("kelvin")), ValueType::Text);
        assert_eq!(ValueType::of(&json!(true)), ValueType::Text);
        assert_eq!(ValueType::of(&json!([10, 20])), ValueType::Numeric);
        assert_eq!(ValueType::of(&json!([])), ValueType::Text);
    }

    #[test]
    fn text_form() {
        assert_eq!(value_as_text(&json!("a b")), "a b");
        assert_eq!(value_as_text(&json!(12)), "12");
        assert_eq!(value_as_text(&json!(true)), "true");
    }
}
