//! Field-level comparison of incoming records against stored rows

use serde_json::{Map, Value};

use crate::schema::LINEAGE_COLUMN;
use crate::warehouse::Row;

/// How one incoming record will be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Arrived without a key; one is minted at insert time
    Insert,
    /// Key present and found in storage
    Update { key: String },
    /// Key present but missing from storage; inserted with the given key
    RequiresFallbackInsert { key: String },
}

/// Changed fields of one record: values before and after
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDiff {
    pub previous: Row,
    pub current: Row,
}

impl FieldDiff {
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

/// Fields of `incoming` whose value differs from `stored`. Lineage metadata
/// is ignored; a field missing from `stored` compares as null.
pub fn diff(stored: &Row, incoming: &Row) -> FieldDiff {
    let mut out = FieldDiff::default();
    for (field, new_value) in incoming {
        if field == LINEAGE_COLUMN {
            continue;
        }
        let old_value = stored.get(field).unwrap_or(&Value::Null);
        if !same_value(old_value, new_value) {
            out.previous.insert(field.clone(), old_value.clone());
            out.current.insert(field.clone(), new_value.clone());
        }
    }
    out
}

/// JSON equality where numbers compare by numeric value (`1` equals `1.0`).
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_value(x, y))
        },
        (Value::Object(xs), Value::Object(ys)) => same_object(xs, ys),
        _ => a == b,
    }
}

fn same_object(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| same_value(v, other)))
}
