//! Record-level comparison of two capture payloads.
//!
//! A payload that is a JSON array is treated as a list of records; anything else is a
//! single record. Records are matched on the caller's key fields. With no key fields
//! the whole record is its key, which reduces the diff to a set difference.
//!
//! Several records in one payload may share a key. They are paired with the other
//! payload's records for that key in payload order, the surplus counts as added or
//! removed, and the key is listed in `duplicate_keys`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::manifest::canonical_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedRecord {
    /// Canonical JSON of the key fields
    pub key: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureDiff {
    pub business_key: String,
    pub capture_a: String,
    pub capture_b: String,
    /// In `b` but not `a`
    pub added: Vec<Value>,
    /// In `a` but not `b`
    pub removed: Vec<Value>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged: usize,
    /// Keys held by more than one record in either payload
    pub duplicate_keys: Vec<String>,
}

impl CaptureDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Records of `a` and `b` classified as added/removed/changed.
pub(crate) struct RecordDiff {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged: usize,
    pub duplicate_keys: Vec<String>,
}

fn records(payload: &Value) -> Vec<&Value> {
    match payload {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn record_key(record: &Value, key_fields: &[&str]) -> String {
    if key_fields.is_empty() {
        return canonical_json(record);
    }
    let key: serde_json::Map<String, Value> = key_fields
        .iter()
        .map(|f| {
            let v = record.get(*f).cloned().unwrap_or(Value::Null);
            (f.to_string(), v)
        })
        .collect();
    canonical_json(&Value::Object(key))
}

fn field_changes(before: &Value, after: &Value) -> Vec<FieldChange> {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            let fields: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            fields
                .into_iter()
                .filter_map(|field| {
                    let before = a.get(field).cloned().unwrap_or(Value::Null);
                    let after = b.get(field).cloned().unwrap_or(Value::Null);
                    (before != after).then(|| FieldChange {
                        field: field.clone(),
                        before,
                        after,
                    })
                })
                .collect()
        }
        (a, b) if a != b => vec![FieldChange {
            field: String::new(),
            before: a.clone(),
            after: b.clone(),
        }],
        _ => Vec::new(),
    }
}

pub(crate) fn diff_payloads(a: &Value, b: &Value, key_fields: &[&str]) -> RecordDiff {
    let index = |payload: &Value| -> BTreeMap<String, Vec<Value>> {
        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for record in records(payload) {
            grouped
                .entry(record_key(record, key_fields))
                .or_default()
                .push(record.clone());
        }
        grouped
    };
    let before = index(a);
    let after = index(b);

    let mut diff = RecordDiff {
        added: Vec::new(),
        removed: Vec::new(),
        changed: Vec::new(),
        unchanged: 0,
        duplicate_keys: before
            .iter()
            .chain(after.iter())
            .filter(|(_, group)| group.len() > 1)
            .map(|(key, _)| key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };

    let empty = Vec::new();
    for (key, old_group) in &before {
        let new_group = after.get(key).unwrap_or(&empty);
        for (i, old) in old_group.iter().enumerate() {
            let Some(new) = new_group.get(i) else {
                diff.removed.push(old.clone());
                continue;
            };
            let changes = field_changes(old, new);
            if changes.is_empty() {
                diff.unchanged += 1;
            } else {
                diff.changed.push(ChangedRecord {
                    key: key.clone(),
                    changes,
                });
            }
        }
    }
    for (key, new_group) in &after {
        let paired = before.get(key).map_or(0, Vec::len);
        diff.added.extend(new_group.iter().skip(paired).cloned());
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keyed_diff_classifies_records() {
        let a = json!([
            {"symbol": "AAPL", "volume": 100},
            {"symbol": "MSFT", "volume": 50},
            {"symbol": "TSLA", "volume": 7},
        ]);
        let b = json!([
            {"symbol": "AAPL", "volume": 120},
            {"symbol": "MSFT", "volume": 50},
            {"symbol": "NVDA", "volume": 9},
        ]);

        let diff = diff_payloads(&a, &b, &["symbol"]);
        assert_eq!(diff.added, vec![json!({"symbol": "NVDA", "volume": 9})]);
        assert_eq!(diff.removed, vec![json!({"symbol": "TSLA", "volume": 7})]);
        assert_eq!(diff.unchanged, 1);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(
            diff.changed[0].changes,
            vec![FieldChange {
                field: "volume".to_string(),
                before: json!(100),
                after: json!(120),
            }]
        );
    }

    #[test]
    fn test_unkeyed_diff_is_set_difference() {
        let a = json!([{"n": 1}, {"n": 2}]);
        let b = json!([{"n": 2}, {"n": 3}]);
        let diff = diff_payloads(&a, &b, &[]);
        assert_eq!(diff.added, vec![json!({"n": 3})]);
        assert_eq!(diff.removed, vec![json!({"n": 1})]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_object_payload_is_one_record() {
        let a = json!({"id": 1, "total": 10, "note": "x"});
        let b = json!({"id": 1, "total": 11});
        let diff = diff_payloads(&a, &b, &["id"]);
        assert_eq!(diff.changed.len(), 1);
        let fields: Vec<_> = diff.changed[0].changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["note", "total"]);
    }

    #[test]
    fn test_shared_keys_are_paired_not_collapsed() {
        let a = json!([
            {"symbol": "AAPL", "venue": "X", "volume": 10},
            {"symbol": "AAPL", "venue": "Y", "volume": 20},
            {"symbol": "MSFT", "venue": "X", "volume": 5},
        ]);
        let b = json!([
            {"symbol": "AAPL", "venue": "X", "volume": 10},
            {"symbol": "MSFT", "venue": "X", "volume": 6},
        ]);

        let diff = diff_payloads(&a, &b, &["symbol"]);
        assert_eq!(diff.unchanged, 1);
        assert_eq!(diff.removed, vec![json!({"symbol": "AAPL", "venue": "Y", "volume": 20})]);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.added.is_empty());
        assert_eq!(diff.duplicate_keys, vec![r#"{"symbol":"AAPL"}"#.to_string()]);
    }
}
