//! Field-level diff between two workflow definition snapshots.
//!
//! The diff is informational: rollback replaces the whole definition, so
//! nothing here feeds back into storage. Objects recurse by key, arrays are
//! compared index-wise with extra elements reported as added or removed.

use serde_json::Value;
use serde::Serialize;

/// A single field-level change between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// JSON-pointer-like path, e.g. `actions/2/subject`
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

/// Diff between two workflow definitions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffReport {
    pub added: Vec<FieldChange>,
    pub removed: Vec<FieldChange>,
    pub changed: Vec<FieldChange>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Total number of reported changes.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

/// Compare two JSON documents and report field-level changes.
pub fn compare(old: &Value, new: &Value) -> DiffReport {
    let mut report = DiffReport::default();
    walk(old, new, "", &mut report);
    report
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", path, key)
    }
}

fn walk(old: &Value, new: &Value, path: &str, report: &mut DiffReport) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = join(path, key);
                match new_map.get(key) {
                    Some(new_value) => walk(old_value, new_value, &child, report),
                    None => report.removed.push(FieldChange {
                        path: child,
                        old: Some(old_value.clone()),
                        new: None,
                    }),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    report.added.push(FieldChange {
                        path: join(path, key),
                        old: None,
                        new: Some(new_value.clone()),
                    });
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let shared = old_items.len().min(new_items.len());
            for i in 0..shared {
                walk(&old_items[i], &new_items[i], &join(path, &i.to_string()), report);
            }
            for (i, item) in old_items.iter().enumerate().skip(shared) {
                report.removed.push(FieldChange {
                    path: join(path, &i.to_string()),
                    old: Some(item.clone()),
                    new: None,
                });
            }
            for (i, item) in new_items.iter().enumerate().skip(shared) {
                report.added.push(FieldChange {
                    path: join(path, &i.to_string()),
                    old: None,
                    new: Some(item.clone()),
                });
            }
        }
        (old_value, new_value) => {
            if old_value != new_value {
                report.changed.push(FieldChange {
                    path: path.to_string(),
                    old: Some(old_value.clone()),
                    new: Some(new_value.clone()),
                });
            }
        }
    }
}
