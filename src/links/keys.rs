#![forbid(unsafe_code)]

//! Reading ids and metadata out of link storage fields.
//!
//! A storage field holds one of: a bare id, an array of ids, an object with
//! `_id` plus attributes, or an array of such objects. The readers here accept
//! every shape so joins keep working on slightly inconsistent data.

use serde_json::Value;

use crate::types::{DocKey, Document, ID_FIELD};

/// Id carried by one storage entry.
fn entry_id(entry: &Value) -> Option<&Value> {
    match entry {
        Value::Null | Value::Array(_) => None,
        Value::Object(map) => map.get(ID_FIELD).filter(|id| !id.is_null()),
        scalar => Some(scalar),
    }
}

/// Every target id referenced by a storage field value, in stored order.
pub fn referenced_ids(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter_map(entry_id).collect(),
        other => entry_id(other).into_iter().collect(),
    }
}

/// Keys of every target id referenced by the document's `field`.
pub fn referenced_keys(doc: &Document, field: &str) -> Vec<DocKey> {
    doc.get(field)
        .map(|value| {
            referenced_ids(value)
                .into_iter()
                .filter_map(DocKey::from_value)
                .collect()
        })
        .unwrap_or_default()
}

/// Extra attributes stored alongside the reference to `target` in `field`.
///
/// Returns `None` when the field holds no object entry for that id.
pub fn entry_metadata(doc: &Document, field: &str, target: &DocKey) -> Option<Document> {
    let value = doc.get(field)?;
    let entries: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    entries.into_iter().find_map(|entry| {
        let map = entry.as_object()?;
        let id = map.get(ID_FIELD).and_then(DocKey::from_value)?;
        if &id != target {
            return None;
        }
        Some(
            map.iter()
                .filter(|(key, _)| key.as_str() != ID_FIELD)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    })
}
