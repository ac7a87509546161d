//! Scalar coercion from raw JSON leaves to typed [`Value`]s.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracksync_core::{FieldType, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected:?}: {reason}")]
pub struct CoercionError {
    pub expected: FieldType,
    pub reason: &'static str,
}

fn fail(expected: FieldType, reason: &'static str) -> CoercionError {
    CoercionError { expected, reason }
}

/// Null-like raw inputs: `null`, `""`, `"[]"`, `[]` and `{}`.
pub fn is_blank(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty() || s == "[]",
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Collapse every null-like value to the canonical marker.
pub fn canonical_null(value: Value) -> Value {
    match value {
        Value::Text(s) if s.is_empty() || s == "[]" => Value::Null,
        other => other,
    }
}

/// Coerce one raw leaf into `field_type`. Blank input is `Ok(Value::Null)`;
/// an `Err` means the caller should degrade the field to `Null`.
pub fn coerce(field_type: FieldType, raw: &JsonValue) -> Result<Value, CoercionError> {
    if is_blank(raw) {
        return Ok(Value::Null);
    }

    if field_type != FieldType::StringList {
        if let JsonValue::Array(items) = raw {
            if let [only] = items.as_slice() {
                if !only.is_array() && !only.is_object() {
                    return coerce(field_type, only);
                }
            }
        }
    }

    let value = match field_type {
        FieldType::Identifier | FieldType::Text => match raw {
            JsonValue::String(s) => Value::Text(s.clone()),
            JsonValue::Number(n) => Value::Text(n.to_string()),
            JsonValue::Bool(b) => Value::Text(b.to_string()),
            other => Value::Text(other.to_string()),
        },
        FieldType::Boolean => match raw {
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
            JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
            _ => return Err(fail(field_type, "not a boolean")),
        },
        FieldType::Integer => match raw {
            JsonValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(integral))
                .map(Value::Integer)
                .ok_or_else(|| fail(field_type, "number is not integral"))?,
            JsonValue::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
                    .map(Value::Integer)
                    .ok_or_else(|| fail(field_type, "text is not an integer"))?
            }
            _ => return Err(fail(field_type, "not an integer")),
        },
        FieldType::Float => match raw {
            JsonValue::Number(n) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| fail(field_type, "number out of range"))?,
            JsonValue::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .map(Value::Float)
                .ok_or_else(|| fail(field_type, "text is not numeric"))?,
            // the serialized list is only kept in the warning; the column stays numeric
            JsonValue::Array(_) => return Err(fail(field_type, "list-encoded amount")),
            _ => return Err(fail(field_type, "not numeric")),
        },
        FieldType::Timestamp => match raw {
            JsonValue::String(s) => parse_timestamp(s)
                .map(Value::Timestamp)
                .ok_or_else(|| fail(field_type, "unparsable timestamp"))?,
            _ => return Err(fail(field_type, "timestamp is not text")),
        },
        FieldType::Duration => match raw {
            JsonValue::String(s) => parse_iso8601_duration(s)
                .map(Value::Duration)
                .ok_or_else(|| fail(field_type, "unparsable ISO-8601 duration"))?,
            _ => return Err(fail(field_type, "duration is not text")),
        },
        FieldType::StringList => match raw {
            JsonValue::Array(_) => Value::Text(raw.to_string()),
            JsonValue::Object(_) => return Err(fail(field_type, "object is not a list")),
            scalar => Value::Text(JsonValue::Array(vec![scalar.clone()]).to_string()),
        },
    };

    Ok(canonical_null(value))
}

fn integral(x: f64) -> Option<i64> {
    (x.is_finite() && x.fract() == 0.0 && x.abs() < i64::MAX as f64).then_some(x as i64)
}

/// Parse upstream timestamp text into a timezone-naive UTC instant.
///
/// Accepts RFC 3339 with `Z` or an offset, offset-less date-times (taken as
/// UTC) and bare dates (midnight).
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parse an ISO-8601 duration (`PT1H30M`, `P2DT4H`, `P1W`, `PT0.5S`).
///
/// Calendar units (years, months) have no fixed length and are rejected.
pub fn parse_iso8601_duration(text: &str) -> Option<chrono::Duration> {
    let text = text.trim();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let body = text.strip_prefix('P')?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((_, "")) => return None,
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };

    let mut total = chrono::Duration::zero();
    let mut components = 0usize;

    let mut rank = 0u8;
    for (number, unit) in components_of(date_part)? {
        let (unit_rank, secs) = match unit {
            'W' => (1, 7 * 86_400),
            'D' => (2, 86_400),
            _ => return None,
        };
        if unit_rank <= rank {
            return None;
        }
        rank = unit_rank;
        total = total.checked_add(&scaled(number, secs)?)?;
        components += 1;
    }

    if let Some(time_part) = time_part {
        let mut rank = 0u8;
        for (number, unit) in components_of(time_part)? {
            let (unit_rank, secs) = match unit {
                'H' => (1, 3_600),
                'M' => (2, 60),
                'S' => (3, 1),
                _ => return None,
            };
            if unit_rank <= rank {
                return None;
            }
            rank = unit_rank;
            total = total.checked_add(&scaled(number, secs)?)?;
            components += 1;
        }
    }

    if components == 0 {
        return None;
    }
    Some(if negative { -total } else { total })
}

fn components_of(part: &str) -> Option<Vec<(&str, char)>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            continue;
        }
        let number = &part[start..idx];
        if number.is_empty() {
            return None;
        }
        out.push((number, ch));
        start = idx + ch.len_utf8();
    }
    // trailing digits without a unit designator
    if start != part.len() {
        return None;
    }
    Some(out)
}

fn scaled(number: &str, unit_secs: i64) -> Option<chrono::Duration> {
    if number.contains(['.', ',']) {
        let x: f64 = number.replace(',', ".").parse().ok()?;
        let nanos = x * unit_secs as f64 * 1e9;
        if !nanos.is_finite() || nanos.abs() > i64::MAX as f64 {
            return None;
        }
        Some(chrono::Duration::nanoseconds(nanos.round() as i64))
    } else {
        let n: i64 = number.parse().ok()?;
        chrono::Duration::try_seconds(n.checked_mul(unit_secs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn durations_parse_to_exact_spans() {
        assert_eq!(
            parse_iso8601_duration("PT1H30M"),
            Some(chrono::Duration::minutes(90))
        );
        assert_eq!(parse_iso8601_duration("PT0S"), Some(chrono::Duration::zero()));
        assert_eq!(
            parse_iso8601_duration("P1DT2H"),
            Some(chrono::Duration::hours(26))
        );
        assert_eq!(parse_iso8601_duration("P2W"), Some(chrono::Duration::days(14)));
        assert_eq!(
            parse_iso8601_duration("PT0.5S"),
            Some(chrono::Duration::milliseconds(500))
        );
        assert_eq!(
            parse_iso8601_duration("-PT15M"),
            Some(-chrono::Duration::minutes(15))
        );
    }

    #[test]
    fn malformed_durations_are_rejected() {
        for text in ["not-a-duration", "P", "PT", "PT1H30", "PT30M1H", "P1Y", "P1M", "1H", "PTXS"] {
            assert_eq!(parse_iso8601_duration(text), None, "{text}");
        }
    }

    #[test]
    fn timestamps_drop_their_offset_after_conversion_to_utc() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-05-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T14:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:00:00.000Z"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-05-01"),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn blank_inputs_share_one_marker() {
        for field_type in [FieldType::Text, FieldType::Float, FieldType::StringList, FieldType::Duration] {
            for raw in [json!(null), json!(""), json!([]), json!("[]"), json!({})] {
                assert_eq!(coerce(field_type, &raw), Ok(Value::Null), "{field_type:?} {raw}");
            }
        }
    }

    #[test]
    fn amounts_coerce_to_float_and_reject_multi_element_lists() {
        assert_eq!(coerce(FieldType::Float, &json!(2500)), Ok(Value::Float(2500.0)));
        assert_eq!(coerce(FieldType::Float, &json!("12.5")), Ok(Value::Float(12.5)));
        assert_eq!(coerce(FieldType::Float, &json!([3])), Ok(Value::Float(3.0)));
        assert_eq!(
            coerce(FieldType::Float, &json!([1, 2])),
            Err(CoercionError {
                expected: FieldType::Float,
                reason: "list-encoded amount"
            })
        );
        assert!(coerce(FieldType::Float, &json!("lots")).is_err());
    }

    #[test]
    fn string_lists_serialize_to_one_string() {
        assert_eq!(
            coerce(FieldType::StringList, &json!(["a", "b"])),
            Ok(Value::Text(r#"["a","b"]"#.to_string()))
        );
        assert_eq!(
            coerce(FieldType::StringList, &json!("solo")),
            Ok(Value::Text(r#"["solo"]"#.to_string()))
        );
    }

    #[test]
    fn scalars_coerce_by_declared_type() {
        assert_eq!(coerce(FieldType::Boolean, &json!("TRUE")), Ok(Value::Bool(true)));
        assert!(coerce(FieldType::Boolean, &json!(1)).is_err());
        assert_eq!(coerce(FieldType::Integer, &json!(3.0)), Ok(Value::Integer(3)));
        assert_eq!(coerce(FieldType::Integer, &json!("42")), Ok(Value::Integer(42)));
        assert!(coerce(FieldType::Integer, &json!(2.5)).is_err());
        assert_eq!(coerce(FieldType::Identifier, &json!(17)), Ok(Value::Text("17".into())));
        assert!(coerce(FieldType::Duration, &json!(5400)).is_err());
        assert!(coerce(FieldType::Timestamp, &json!("soon")).is_err());
    }
}
