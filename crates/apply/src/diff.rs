//! Change summaries and payload size guards.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub fn max_object_nodes() -> usize {
    std::env::var("KEEL_MAX_OBJECT_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// True once the document has `max` or more JSON nodes. Stops walking early.
pub fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Drop store-maintained members so two revisions of an object compare on content only.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("revision");
    }
    v
}

/// Count members added, changed and removed going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (Json::Null, bv) if !bv.is_null() => s.removes += 1,
            (av, Json::Null) if !av.is_null() => s.adds += 1,
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_store_fields() {
        let v = json!({
            "kind": "Widget",
            "metadata": { "name": "x", "revision": 3, "managedFields": [ { "manager": "m" } ] },
            "spec": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("revision"));
        assert_eq!(meta["name"], "x");
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3], "gone": true });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 2 });
    }

    #[test]
    fn diff_against_nothing_is_one_add() {
        let s = diff_summary(&json!({ "spec": { "x": 1 } }), &Json::Null);
        assert_eq!(s.adds, 1);
        assert!(diff_summary(&json!({ "a": 1 }), &json!({ "a": 1 })).is_empty());
    }

    #[test]
    fn node_budget_stops_at_max() {
        let v = json!({ "a": [1, 2, 3], "b": { "c": 1 } });
        assert!(json_node_budget_exceeded(&v, 3));
        assert!(!json_node_budget_exceeded(&v, 100));
    }
}
