//! Record normalization: canonical payloads, natural keys, and timestamp coalescing.

use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::descriptor::{RecordShape, ResourceDescriptor};
use crate::domain::Timestamp;

/// Ordered natural-key components. Composite keys keep descriptor field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact JSON array form used as a primary key by the warehouse.
    pub fn storage_key(&self) -> String {
        let parts = self.0.iter().cloned().map(Value::String).collect();
        Value::Array(parts).to_string()
    }
}

impl Display for NaturalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub canonical_payload: String,
    pub natural_key: NaturalKey,
    pub timestamp: Option<Timestamp>,
}

/// Why an item did not become a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordDefect {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record is missing natural key field '{field}'")]
    MissingNaturalKey { field: String },
    #[error("record has no resolvable timestamp")]
    MissingTimestamp,
}

impl RecordDefect {
    /// Malformed records are counted separately from skipped ones.
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::NotAnObject | Self::MissingNaturalKey { .. })
    }
}

/// Normalizes one fetched item.
///
/// Incremental resources require a timestamp (checked first) and every natural-key field.
/// Snapshot resources accept any object.
pub fn normalize(item: &Value, descriptor: &ResourceDescriptor) -> Result<RawRecord, RecordDefect> {
    if !item.is_object() {
        return Err(RecordDefect::NotAnObject);
    }

    let shaped = match descriptor.shape {
        RecordShape::Flat => None,
        RecordShape::PositionUpdate => flatten_position_update(item),
    };
    let record = shaped.as_ref().unwrap_or(item);
    let timestamp = coalesce_timestamp(record, descriptor.timestamp_paths);

    if !descriptor.is_incremental() {
        return Ok(RawRecord {
            canonical_payload: canonical_json(record),
            natural_key: NaturalKey::default(),
            timestamp,
        });
    }

    let Some(timestamp) = timestamp else {
        return Err(RecordDefect::MissingTimestamp);
    };

    let mut parts = Vec::with_capacity(descriptor.natural_key.len());
    for field in descriptor.natural_key {
        let part = lookup_path(record, field)
            .and_then(key_part)
            .or_else(|| synthetic_key_part(descriptor, field, record, timestamp))
            .ok_or_else(|| RecordDefect::MissingNaturalKey {
                field: (*field).to_owned(),
            })?;
        parts.push(part);
    }

    Ok(RawRecord {
        canonical_payload: canonical_json(record),
        natural_key: NaturalKey::new(parts),
        timestamp: Some(timestamp),
    })
}

/// `{uid, timestamp, ..event.PositionUpdate}`; `None` when the item has no position update.
fn flatten_position_update(item: &Value) -> Option<Value> {
    let update = lookup_path(item, "event.PositionUpdate")?.as_object()?;

    let mut flattened = Map::new();
    for key in ["uid", "timestamp"] {
        if let Some(value) = item.get(key) {
            flattened.insert(key.to_owned(), value.clone());
        }
    }
    for (key, value) in update {
        flattened.insert(key.clone(), value.clone());
    }
    Some(Value::Object(flattened))
}

/// Funding and other non-trade position updates carry no `executionUid`.
fn synthetic_key_part(
    descriptor: &ResourceDescriptor,
    field: &str,
    record: &Value,
    timestamp: Timestamp,
) -> Option<String> {
    if descriptor.shape != RecordShape::PositionUpdate || field != "executionUid" {
        return None;
    }
    let part = |name: &str| {
        record
            .get(name)
            .and_then(key_part)
            .unwrap_or_else(|| String::from("unknown"))
    };
    Some(format!(
        "{}-{}-{}",
        part("updateReason"),
        part("tradeable"),
        timestamp.as_millis()
    ))
}

fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Resolves a dotted path such as `takerOrder.timestamp`.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// First path whose value converts to a timestamp.
pub fn coalesce_timestamp(value: &Value, paths: &[&str]) -> Option<Timestamp> {
    paths
        .iter()
        .filter_map(|path| lookup_path(value, path))
        .find_map(coerce_timestamp)
}

/// Epoch numbers (seconds or millis), numeric strings, or ISO-8601 strings.
pub fn coerce_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(number) => number.as_f64().and_then(Timestamp::from_epoch_number),
        Value::String(text) if !text.trim().is_empty() => Timestamp::parse(text).ok(),
        _ => None,
    }
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (index, (key, nested)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(nested, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, nested) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(nested, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
