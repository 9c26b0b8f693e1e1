//! Structural diff over agent states.
//!
//! Two snapshots are compared by recursive descent over their canonical
//! JSON values. Objects recurse per key; every other node pair compares
//! whole-value by canonical encoding, so arrays are positional (a
//! mismatch anywhere emits a single `Changed` at the array path) and
//! line-oriented text diffing is out of scope by design. Results are
//! plain data: a list of tagged change entries with the path from the
//! state root, array indices rendered in decimal-string form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    canonical::canonical_eq,
    errors::VcsError,
    hash::ObjectHash,
    internal::object::state::AgentState,
};

/// One structural change between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEntry {
    /// Key present only in the target.
    Added { path: Vec<String>, new: Value },
    /// Key present only in the base.
    Removed { path: Vec<String>, old: Value },
    /// Value differs between base and target.
    Changed {
        path: Vec<String>,
        old: Value,
        new: Value,
    },
}

impl ChangeEntry {
    /// Path from the state root to the changed node.
    pub fn path(&self) -> &[String] {
        match self {
            ChangeEntry::Added { path, .. }
            | ChangeEntry::Removed { path, .. }
            | ChangeEntry::Changed { path, .. } => path,
        }
    }
}

/// Structural comparison of two committed states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDiff {
    /// Commit the comparison started from.
    pub base: ObjectHash,
    /// Commit compared against.
    pub target: ObjectHash,
    pub entries: Vec<ChangeEntry>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compare two JSON values; entries are ordered by a sorted-key walk, so
/// the output is deterministic.
pub fn diff_values(base: &Value, target: &Value) -> Vec<ChangeEntry> {
    let mut entries = Vec::new();
    let mut path = Vec::new();
    walk(&mut path, base, target, &mut entries);
    entries
}

/// Compare two agent states through their canonical values.
pub fn diff_states(base: &AgentState, target: &AgentState) -> Result<Vec<ChangeEntry>, VcsError> {
    Ok(diff_values(
        &base.canonical_value()?,
        &target.canonical_value()?,
    ))
}

fn walk(path: &mut Vec<String>, base: &Value, target: &Value, out: &mut Vec<ChangeEntry>) {
    if canonical_eq(base, target) {
        return;
    }
    match (base, target) {
        (Value::Object(base_map), Value::Object(target_map)) => {
            let mut keys: Vec<&String> = base_map.keys().chain(target_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(key.clone());
                match (base_map.get(key), target_map.get(key)) {
                    (Some(old), None) => out.push(ChangeEntry::Removed {
                        path: path.clone(),
                        old: old.clone(),
                    }),
                    (None, Some(new)) => out.push(ChangeEntry::Added {
                        path: path.clone(),
                        new: new.clone(),
                    }),
                    (Some(old), Some(new)) => walk(path, old, new, out),
                    (None, None) => {}
                }
                path.pop();
            }
        }
        _ => out.push(ChangeEntry::Changed {
            path: path.clone(),
            old: base.clone(),
            new: target.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn diff_of_identical_values_is_empty() {
        let v = json!({"memory": {"a": [1, 2]}, "cost": 0});
        assert!(diff_values(&v, &v).is_empty());
    }

    #[test]
    fn diff_classifies_added_removed_changed() {
        let base = json!({"memory": {"a": 1, "b": 2}});
        let target = json!({"memory": {"a": 1, "b": 3, "c": 4}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            ChangeEntry::Changed {
                path: vec!["memory".into(), "b".into()],
                old: json!(2),
                new: json!(3),
            }
        );
        assert_eq!(
            entries[1],
            ChangeEntry::Added {
                path: vec!["memory".into(), "c".into()],
                new: json!(4),
            }
        );
    }

    #[test]
    fn diff_is_symmetric_under_swap() {
        let a = json!({"x": {"k": 1}, "y": [1, 2], "z": "s"});
        let b = json!({"x": {"k": 2}, "y": [1, 3], "w": true});
        let forward = diff_values(&a, &b);
        let backward = diff_values(&b, &a);
        assert_eq!(forward.len(), backward.len());
        for entry in &forward {
            let mirrored = match entry.clone() {
                ChangeEntry::Added { path, new } => ChangeEntry::Removed { path, old: new },
                ChangeEntry::Removed { path, old } => ChangeEntry::Added { path, new: old },
                ChangeEntry::Changed { path, old, new } => ChangeEntry::Changed {
                    path,
                    old: new,
                    new: old,
                },
            };
            assert!(backward.contains(&mirrored), "missing mirror of {entry:?}");
        }
    }

    #[test]
    fn arrays_change_as_whole_values() {
        let base = json!({"items": [1, 2, 3]});
        let target = json!({"items": [1, 9, 3]});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            ChangeEntry::Changed { path, old, new } => {
                assert_eq!(path, &vec!["items".to_string()]);
                assert_eq!(old, &json!([1, 2, 3]));
                assert_eq!(new, &json!([1, 9, 3]));
            }
            other => panic!("expected Changed, got {other:?}"),
        }
    }

    #[test]
    fn scalar_root_change_has_empty_path() {
        let entries = diff_values(&json!(1), &json!(2));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path().is_empty());
    }

    #[test]
    fn key_order_does_not_produce_changes() {
        let a: Value = serde_json::from_str(r#"{"m":{"x":1,"y":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"m":{"y":2,"x":1}}"#).unwrap();
        assert!(diff_values(&a, &b).is_empty());
    }
}
