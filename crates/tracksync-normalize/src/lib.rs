//! Turns nested upstream payloads into flat, typed, relationally-decomposed records.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use tracksync_core::{
    key_is_under, EntityKind, EntitySchema, FieldType, JunctionDef, Record, Relation, Value,
};

mod coerce;
mod payload;

pub use coerce::{
    canonical_null, coerce, is_blank, parse_iso8601_duration, parse_timestamp, CoercionError,
};
pub use payload::{load_payload_file, parse_payload, unwrap_envelope, PayloadError};

pub const CRATE_NAME: &str = "tracksync-normalize";

/// Input-shape errors. Each one is fatal for the entity type's whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{entity}: payload must be a list of objects or a single object, got {found}")]
    NotAList { entity: EntityKind, found: &'static str },
    #[error("{entity}: element {index} has no usable `id`")]
    MissingId { entity: EntityKind, index: usize },
    #[error("{entity}: column `{field}` is absent from every element of the batch")]
    MissingColumn { entity: EntityKind, field: String },
    #[error("{entity}: unexpected column `{field}`")]
    UnexpectedColumn { entity: EntityKind, field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Normalized {
    Empty,
    Batch(NormalizedBatch),
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        matches!(self, Normalized::Empty)
    }

    pub fn into_batch(self) -> Option<NormalizedBatch> {
        match self {
            Normalized::Empty => None,
            Normalized::Batch(batch) => Some(batch),
        }
    }
}

/// One entity type's records plus the junction rows extracted from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedBatch {
    pub entity: EntityKind,
    pub primary: Relation,
    pub derived: BTreeMap<String, Relation>,
}

impl NormalizedBatch {
    /// Primary relation first, then derived relations by name.
    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        std::iter::once(&self.primary).chain(self.derived.values())
    }

    pub fn derived(&self, relation: &str) -> Option<&Relation> {
        self.derived.get(relation)
    }
}

/// camelCase -> snake_case. A `_` goes before every capital that starts a new
/// word: one followed by a lowercase letter, or one after a lowercase letter
/// or digit. Existing underscores are never doubled.
pub fn camel_to_snake(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let prev_ends_word = prev.is_lowercase() || prev.is_ascii_digit();
            if prev != '_' && (next_is_lower || prev_ends_word) {
                out.push('_');
            }
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// Schema-driven normalizer for one entity type.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    schema: &'static EntitySchema,
}

impl Normalizer {
    pub fn for_entity(kind: EntityKind) -> Self {
        Self {
            schema: kind.schema(),
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.schema.kind
    }

    pub fn normalize(&self, payload: Option<&JsonValue>) -> Result<Normalized, NormalizeError> {
        let entity = self.schema.kind;
        let Some(payload) = payload else {
            return Ok(Normalized::Empty);
        };
        let elements: &[JsonValue] = match payload {
            JsonValue::Null => return Ok(Normalized::Empty),
            JsonValue::Array(items) => items,
            JsonValue::Object(obj) if obj.is_empty() => return Ok(Normalized::Empty),
            JsonValue::Object(_) => std::slice::from_ref(payload),
            other => {
                return Err(NormalizeError::NotAList {
                    entity,
                    found: json_kind(other),
                })
            }
        };
        if elements.is_empty() {
            return Ok(Normalized::Empty);
        }

        let mut records = Vec::with_capacity(elements.len());
        let mut pairs: Vec<IndexSet<(String, String)>> =
            vec![IndexSet::new(); self.schema.junctions.len()];
        let mut seen_columns: BTreeSet<&'static str> = BTreeSet::new();
        let mut unknown_columns: BTreeSet<String> = BTreeSet::new();

        for (index, element) in elements.iter().enumerate() {
            let JsonValue::Object(obj) = element else {
                warn!(entity = %entity, index, found = json_kind(element), "skipping non-object element");
                continue;
            };

            let mut flat = IndexMap::new();
            self.flatten("", obj, &mut flat);
            let split = self.partition(flat);

            seen_columns.extend(split.columns.keys().copied());
            unknown_columns.extend(split.unknown);

            let record = self.build_record(index, split.columns)?;
            let parent_id = record.id().unwrap_or_default().to_string();
            for (slot, (junction, collection)) in split.collections.into_iter().enumerate() {
                collect_pairs(entity, junction, &parent_id, collection, &mut pairs[slot]);
            }
            records.push(record);
        }

        if records.is_empty() {
            warn!(entity = %entity, elements = elements.len(), "no object elements in payload");
            return Ok(Normalized::Empty);
        }

        if self.schema.ordered {
            if let Some(field) = unknown_columns.into_iter().next() {
                return Err(NormalizeError::UnexpectedColumn { entity, field });
            }
            if let Some(missing) = self.schema.column_names().find(|c| !seen_columns.contains(c)) {
                return Err(NormalizeError::MissingColumn {
                    entity,
                    field: missing.to_string(),
                });
            }
        } else if !unknown_columns.is_empty() {
            debug!(entity = %entity, columns = ?unknown_columns, "dropping unknown columns");
        }

        let derived = self
            .schema
            .junctions
            .iter()
            .zip(pairs)
            .map(|(junction, pairs)| {
                let rows = pairs
                    .into_iter()
                    .map(|(parent, child)| {
                        let mut row = Record::with_capacity(2);
                        row.insert(junction.parent_column, parent);
                        row.insert(junction.child_column, child);
                        row
                    })
                    .collect();
                (
                    junction.table.to_string(),
                    Relation::with_records(junction.table, rows),
                )
            })
            .collect();

        Ok(Normalized::Batch(NormalizedBatch {
            entity,
            primary: Relation::with_records(entity.relation_name(), records),
            derived,
        }))
    }

    /// Flatten nested objects into `storage_key -> leaf`. Lists, scalars,
    /// `null` and empty objects are leaves.
    fn flatten<'a>(
        &self,
        prefix: &str,
        obj: &'a serde_json::Map<String, JsonValue>,
        out: &mut IndexMap<String, &'a JsonValue>,
    ) {
        for (key, value) in obj {
            let raw = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}_{key}")
            };
            match value {
                JsonValue::Object(inner) if !inner.is_empty() => self.flatten(&raw, inner, out),
                leaf => {
                    out.insert(self.storage_key(&raw), leaf);
                }
            }
        }
    }

    fn storage_key(&self, raw: &str) -> String {
        let rewritten = self
            .schema
            .key_rewrites
            .iter()
            .fold(raw.to_string(), |acc, (from, to)| acc.replace(from, to));
        camel_to_snake(&rewritten)
    }

    fn partition<'a>(&self, flat: IndexMap<String, &'a JsonValue>) -> Partitioned<'a> {
        let mut split = Partitioned {
            columns: IndexMap::new(),
            collections: self.schema.junctions.iter().map(|j| (j, None)).collect(),
            unknown: Vec::new(),
        };

        for (key, raw) in flat {
            if let Some(slot) = self
                .schema
                .junctions
                .iter()
                .position(|j| key_is_under(&key, j.strip))
            {
                let junction = &self.schema.junctions[slot];
                if key == junction.collection || (key == junction.strip && raw.is_array()) {
                    split.collections[slot].1 = Some(raw);
                }
                continue;
            }
            if self.schema.is_discarded(&key) {
                continue;
            }
            if let Some(column) = self.schema.column(&key) {
                split.columns.insert(column.name, raw);
                continue;
            }
            if is_blank(raw) && self.schema.has_columns_under(&key) {
                for column in self.schema.columns_under(&key) {
                    split.columns.entry(column.name).or_insert(&NULL);
                }
                continue;
            }
            split.unknown.push(key);
        }
        split
    }

    fn build_record(
        &self,
        index: usize,
        mut columns: IndexMap<&'static str, &JsonValue>,
    ) -> Result<Record, NormalizeError> {
        let entity = self.schema.kind;
        let id = columns
            .get("id")
            .and_then(|raw| coerce(FieldType::Identifier, raw).ok())
            .filter(|v| !v.is_null())
            .ok_or(NormalizeError::MissingId { entity, index })?;

        let mut record = Record::with_capacity(self.schema.columns.len());
        record.insert("id", id);
        for column in &self.schema.columns[1..] {
            let value = match columns.swap_remove(column.name) {
                None => Value::Null,
                Some(raw) => coerce(column.field_type, raw).unwrap_or_else(|err| {
                    warn!(
                        entity = %entity,
                        column = column.name,
                        raw = %raw,
                        error = %err,
                        "coercion failed, storing null"
                    );
                    Value::Null
                }),
            };
            record.insert(column.name, value);
        }
        Ok(record)
    }
}

static NULL: JsonValue = JsonValue::Null;

struct Partitioned<'a> {
    columns: IndexMap<&'static str, &'a JsonValue>,
    collections: Vec<(&'static JunctionDef, Option<&'a JsonValue>)>,
    unknown: Vec<String>,
}

fn collect_pairs(
    entity: EntityKind,
    junction: &JunctionDef,
    parent_id: &str,
    collection: Option<&JsonValue>,
    pairs: &mut IndexSet<(String, String)>,
) {
    let items = match collection {
        None => return,
        Some(JsonValue::Array(items)) => items,
        Some(other) if is_blank(other) => return,
        Some(other) => {
            warn!(entity = %entity, junction = junction.table, found = json_kind(other), "collection is not a list");
            return;
        }
    };
    for item in items {
        let child = match item {
            JsonValue::Object(obj) => obj.get(junction.element_key),
            _ => None,
        };
        match child.and_then(reference_id) {
            Some(child_id) => {
                pairs.insert((parent_id.to_string(), child_id));
            }
            None => warn!(
                entity = %entity,
                junction = junction.table,
                parent = parent_id,
                "skipping collection element without `{}`",
                junction.element_key
            ),
        }
    }
}

fn reference_id(raw: &JsonValue) -> Option<String> {
    match raw {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
}

/// Normalize one raw payload for `kind`. `None`, `null` and `[]` are `Normalized::Empty`.
pub fn normalize(kind: EntityKind, payload: Option<&JsonValue>) -> Result<Normalized, NormalizeError> {
    Normalizer::for_entity(kind).normalize(payload)
}
