//! The record type flowing through the collect → process → store pipeline.
//!
//! Records are string-keyed maps of JSON values. `serde_json::Map` is
//! backed by a `BTreeMap` (the `preserve_order` feature is off), so
//! serializing a record always emits keys in sorted order — equal records
//! serialize to equal bytes, which the deduplicator relies on for
//! fingerprinting.

use serde_json::Value;

/// One collected record: an unstructured string-keyed map.
pub type Record = serde_json::Map<String, Value>;

/// Render a JSON value the way it should enter a string-typed cleaning
/// rule: strings unquoted, scalars via their display form, and composites
/// as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Build a record from key/value pairs. Test and synthesis helper.
pub fn record_from<I, K>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
