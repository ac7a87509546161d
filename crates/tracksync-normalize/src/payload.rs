//! Raw payload parsing: duplicate-key merging and response envelopes.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::{Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("upstream reported errors: {0}")]
    Upstream(String),
}

/// Parse payload text, merging keys that repeat inside one object:
/// arrays are concatenated, objects merged recursively, scalars last-wins.
pub fn parse_payload(text: &str) -> Result<JsonValue, PayloadError> {
    let MergedValue(value) = serde_json::from_str(text)?;
    Ok(value)
}

/// Read and parse a captured payload file.
pub fn load_payload_file(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_payload(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Strip a GraphQL/REST response envelope down to the record list.
///
/// `{"data": {"<root>": {"nodes": [...]}}}`, `{"nodes": [...]}` and bare arrays
/// yield the array; a lone object yields a one-element array; an envelope
/// without data yields `None`.
pub fn unwrap_envelope(value: JsonValue) -> Result<Option<JsonValue>, PayloadError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Array(_) => Ok(Some(value)),
        JsonValue::Object(mut obj) => {
            if obj.contains_key("data") || obj.contains_key("errors") {
                let data = obj.remove("data").unwrap_or(JsonValue::Null);
                if data.is_null() {
                    return match obj.remove("errors") {
                        Some(JsonValue::Array(errors)) if !errors.is_empty() => {
                            Err(PayloadError::Upstream(upstream_messages(&errors)))
                        }
                        _ => Ok(None),
                    };
                }
                let root = match data {
                    JsonValue::Object(mut roots) if roots.len() == 1 => {
                        roots.into_iter().next().map(|(_, v)| v).unwrap_or(JsonValue::Null)
                    }
                    other => other,
                };
                return unwrap_envelope(root);
            }
            match obj.remove("nodes") {
                Some(nodes) => unwrap_envelope(nodes),
                None => Ok(Some(JsonValue::Array(vec![JsonValue::Object(obj)]))),
            }
        }
        scalar => Ok(Some(JsonValue::Array(vec![scalar]))),
    }
}

fn upstream_messages(errors: &[JsonValue]) -> String {
    errors
        .iter()
        .map(|e| {
            e.get("message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| e.to_string())
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn merge_duplicate(slot: &mut JsonValue, incoming: JsonValue) {
    match (slot, incoming) {
        (JsonValue::Array(existing), JsonValue::Array(more)) => existing.extend(more),
        (JsonValue::Object(existing), JsonValue::Object(more)) => {
            for (key, value) in more {
                match existing.get_mut(&key) {
                    Some(inner) => merge_duplicate(inner, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

struct MergedValue(JsonValue);

impl<'de> Deserialize<'de> for MergedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MergedVisitor;

        impl<'de> Visitor<'de> for MergedVisitor {
            type Value = MergedValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::Bool(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::from(v)))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::from(v)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
                Ok(MergedValue(
                    Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number),
                ))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::String(v.to_string())))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::String(v)))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::Null))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(MergedValue(JsonValue::Null))
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                MergedValue::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(MergedValue(item)) = seq.next_element()? {
                    items.push(item);
                }
                Ok(MergedValue(JsonValue::Array(items)))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    let MergedValue(value) = map.next_value()?;
                    match out.get_mut(&key) {
                        Some(existing) => merge_duplicate(existing, value),
                        None => {
                            out.insert(key, value);
                        }
                    }
                }
                Ok(MergedValue(JsonValue::Object(out)))
            }
        }

        deserializer.deserialize_any(MergedVisitor)
    }
}
