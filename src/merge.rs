//! Merge-base discovery and three-way structural merge.
//!
//! The merge base is the lowest common ancestor of two commits, found by
//! bilateral breadth-first traversal of parent links with side-bit
//! marking; traversal is bounded per side to defend against corrupted or
//! adversarial stores. The three-way merge itself is pure in-memory data
//! flow: at every position the outcome is decided by which sides changed
//! relative to the base, recursing per key only when both sides changed
//! an object differently. Conflicts default to the local side and are
//! reported as paths on the result; strict mode fails instead, for
//! callers that can block on resolution.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    canonical::canonical_eq,
    errors::VcsError,
    hash::ObjectHash,
    internal::object::store::ObjectStore,
};

/// How to combine two branch states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the current branch's state verbatim.
    Ours,
    /// Keep the merged branch's state verbatim.
    Theirs,
    /// Recursive structural merge against the common ancestor.
    ThreeWay,
}

/// Result of a structural merge: the combined value plus the paths where
/// both sides changed irreconcilably (resolved to ours).
#[derive(Debug, Clone)]
pub struct MergedValue {
    pub value: Value,
    pub conflicts: Vec<Vec<String>>,
}

/// Three-way merge of JSON values. `base` is `None` when the commits
/// share no ancestor, which makes every differing position a
/// both-changed position.
pub fn three_way(
    base: Option<&Value>,
    ours: &Value,
    theirs: &Value,
    strict: bool,
) -> Result<MergedValue, VcsError> {
    let mut conflicts = Vec::new();
    let mut path = Vec::new();
    let value = merge_nodes(&mut path, base, Some(ours), Some(theirs), &mut conflicts)
        .unwrap_or(Value::Null);
    if strict && !conflicts.is_empty() {
        return Err(VcsError::MergeConflict(
            conflicts.iter().map(|p| p.join(".")).collect(),
        ));
    }
    Ok(MergedValue { value, conflicts })
}

fn eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => canonical_eq(a, b),
        _ => false,
    }
}

/// One position in the merge. `None` means the key is absent on that
/// side; returning `None` omits the key from the result.
fn merge_nodes(
    path: &mut Vec<String>,
    base: Option<&Value>,
    ours: Option<&Value>,
    theirs: Option<&Value>,
    conflicts: &mut Vec<Vec<String>>,
) -> Option<Value> {
    let ours_changed = !eq(ours, base);
    let theirs_changed = !eq(theirs, base);
    match (ours_changed, theirs_changed) {
        (false, false) => base.cloned(),
        (true, false) => ours.cloned(),
        (false, true) => theirs.cloned(),
        (true, true) => {
            if eq(ours, theirs) {
                return ours.cloned();
            }
            if let (Some(Value::Object(ours_map)), Some(Value::Object(theirs_map))) = (ours, theirs)
            {
                let base_map = match base {
                    Some(Value::Object(map)) => Some(map),
                    _ => None,
                };
                let mut keys: Vec<&String> = ours_map.keys().chain(theirs_map.keys()).collect();
                if let Some(map) = base_map {
                    keys.extend(map.keys());
                }
                keys.sort();
                keys.dedup();
                let mut merged = serde_json::Map::new();
                for key in keys {
                    path.push(key.clone());
                    let child = merge_nodes(
                        path,
                        base_map.and_then(|m| m.get(key)),
                        ours_map.get(key),
                        theirs_map.get(key),
                        conflicts,
                    );
                    path.pop();
                    if let Some(value) = child {
                        merged.insert(key.clone(), value);
                    }
                }
                return Some(Value::Object(merged));
            }
            // Both changed, not both objects: irreconcilable. Local side
            // wins; the path is reported on the result.
            conflicts.push(path.clone());
            ours.cloned()
        }
    }
}

/// Lowest common ancestor of `ours` and `theirs`, or `None` for disjoint
/// histories. Each side expands at most `depth_limit` commits.
pub async fn merge_base(
    store: &ObjectStore,
    ours: ObjectHash,
    theirs: ObjectHash,
    depth_limit: usize,
) -> Result<Option<ObjectHash>, VcsError> {
    let mut marks: HashMap<ObjectHash, u8> = HashMap::new();
    let mut queues = [VecDeque::from([ours]), VecDeque::from([theirs])];
    let mut expanded = [0usize, 0usize];
    loop {
        let mut progressed = false;
        for side in 0..2 {
            let Some(hash) = queues[side].pop_front() else {
                continue;
            };
            progressed = true;
            let bits = marks.entry(hash).or_insert(0);
            if *bits & (1 << side) != 0 {
                continue;
            }
            *bits |= 1 << side;
            if *bits == 0b11 {
                return Ok(Some(hash));
            }
            expanded[side] += 1;
            if expanded[side] > depth_limit {
                return Err(VcsError::DepthLimitExceeded(depth_limit));
            }
            let commit = store.get_commit(&hash).await?;
            for parent in commit.parent_hashes {
                queues[side].push_back(parent);
            }
        }
        if !progressed {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn merge_absorbs_base() {
        let b = json!({"memory": {"k": 1}, "cost": 0});
        let merged = three_way(Some(&b), &b, &b, false).unwrap();
        assert!(canonical_eq(&merged.value, &b));
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn unchanged_side_yields_the_other() {
        let base = json!({"v": 1});
        let theirs = json!({"v": 2});
        let merged = three_way(Some(&base), &base, &theirs, false).unwrap();
        assert_eq!(merged.value, theirs);
        let merged = three_way(Some(&base), &theirs, &base, false).unwrap();
        assert_eq!(merged.value, theirs);
    }

    #[test]
    fn equal_changes_do_not_conflict() {
        let base = json!({"v": 1});
        let both = json!({"v": 7});
        let merged = three_way(Some(&base), &both, &both, false).unwrap();
        assert_eq!(merged.value, both);
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn disjoint_object_changes_combine() {
        let base = json!({"memory": {"a": 1, "b": 1}});
        let ours = json!({"memory": {"a": 2, "b": 1}});
        let theirs = json!({"memory": {"a": 1, "b": 3, "c": 4}});
        let merged = three_way(Some(&base), &ours, &theirs, false).unwrap();
        assert_eq!(merged.value, json!({"memory": {"a": 2, "b": 3, "c": 4}}));
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn scalar_collision_resolves_to_ours_and_reports_path() {
        let base = json!({"memory": {"v": 1}});
        let ours = json!({"memory": {"v": 2}});
        let theirs = json!({"memory": {"v": 3}});
        let merged = three_way(Some(&base), &ours, &theirs, false).unwrap();
        assert_eq!(merged.value, ours);
        assert_eq!(merged.conflicts, vec![vec!["memory".to_string(), "v".to_string()]]);
    }

    #[test]
    fn strict_mode_fails_on_conflict() {
        let base = json!({"v": 1});
        let err = three_way(Some(&base), &json!({"v": 2}), &json!({"v": 3}), true).unwrap_err();
        match err {
            VcsError::MergeConflict(paths) => assert_eq!(paths, vec!["v".to_string()]),
            other => panic!("expected MergeConflict, got {other:?}"),
        }
    }

    #[test]
    fn deletion_on_one_side_wins_over_no_change() {
        let base = json!({"memory": {"a": 1, "b": 2}});
        let ours = json!({"memory": {"a": 1}});
        let merged = three_way(Some(&base), &ours, &base, false).unwrap();
        assert_eq!(merged.value, ours);
    }

    #[test]
    fn array_collision_is_a_single_conflict() {
        let base = json!({"items": [1]});
        let ours = json!({"items": [1, 2]});
        let theirs = json!({"items": [1, 3]});
        let merged = three_way(Some(&base), &ours, &theirs, false).unwrap();
        assert_eq!(merged.value, ours);
        assert_eq!(merged.conflicts, vec![vec!["items".to_string()]]);
    }
}
