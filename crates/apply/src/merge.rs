//! Manager merge, purge of relinquished fields, and field-guided object merge.

use std::fmt;

use serde_json::Value as Json;
use tracing::debug;

use crate::fields::{element_id, FieldManager, FieldPath, FieldsV1, PathElement};

/// A leaf claimed by the incoming manager that another manager already owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConflict {
    pub manager: String,
    pub path: FieldPath,
}

impl fmt::Display for FieldConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (owned by \"{}\")", self.path, self.manager)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("apply conflicts with existing field owners: {}", render(.conflicts))]
pub struct Conflict {
    pub conflicts: Vec<FieldConflict>,
}

fn render(conflicts: &[FieldConflict]) -> String {
    conflicts.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
}

impl Conflict {
    pub fn paths(&self) -> Vec<String> {
        self.conflicts.iter().map(|c| c.path.to_string()).collect()
    }
}

/// Result of merging an incoming manager into the ledger.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub managers: Vec<FieldManager>,
    /// Leaf paths the incoming manager owned before and no longer claims.
    pub removed: Vec<FieldPath>,
}

/// Merge `incoming` into `managers`.
///
/// Without `force`, any leaf the incoming manager claims that another manager owns aborts the
/// whole merge. With `force`, those leaves move to the incoming manager. Managers left owning
/// nothing are dropped.
pub fn merge(managers: &[FieldManager], incoming: FieldManager, force: bool) -> Result<MergeOutcome, Conflict> {
    if !force {
        let mut conflicts = Vec::new();
        for m in managers.iter().filter(|m| m.manager != incoming.manager) {
            for path in overlaps(&m.fields_v1, &incoming.fields_v1) {
                conflicts.push(FieldConflict { manager: m.manager.clone(), path });
            }
        }
        if !conflicts.is_empty() {
            debug!(manager = %incoming.manager, count = conflicts.len(), "apply conflicts detected");
            return Err(Conflict { conflicts });
        }
    }

    let mut out = MergeOutcome::default();
    let claimed = incoming.fields_v1.clone();
    let mut pending = Some(incoming);
    for m in managers {
        if pending.as_ref().is_some_and(|inc| inc.manager == m.manager) {
            out.removed = relinquished(&m.fields_v1, &claimed);
            if let Some(inc) = pending.take().filter(|inc| !inc.fields_v1.is_leaf()) {
                out.managers.push(inc);
            }
            continue;
        }
        let mut tree = m.fields_v1.clone();
        subtract(&mut tree, &claimed);
        if !tree.is_leaf() {
            out.managers.push(FieldManager { fields_v1: tree, ..m.clone() });
        }
    }
    if let Some(inc) = pending.filter(|inc| !inc.fields_v1.is_leaf()) {
        out.managers.push(inc);
    }
    Ok(out)
}

/// Leaf paths present in both trees where either side owns the whole value.
fn overlaps(owned: &FieldsV1, claimed: &FieldsV1) -> Vec<FieldPath> {
    let mut out = Vec::new();
    walk_overlaps(owned, claimed, &FieldPath::root(), &mut out);
    out
}

fn walk_overlaps(owned: &FieldsV1, claimed: &FieldsV1, path: &FieldPath, out: &mut Vec<FieldPath>) {
    for (el, c) in claimed.children.iter() {
        if let Some(o) = owned.children.get(el) {
            let here = path.child(el.clone());
            if o.is_leaf() || c.is_leaf() {
                out.push(here);
            } else {
                walk_overlaps(o, c, &here, out);
            }
        }
    }
}

/// Remove from `tree` everything `claimed` covers, pruning emptied containers.
fn subtract(tree: &mut FieldsV1, claimed: &FieldsV1) {
    for (el, c) in claimed.children.iter() {
        let drop = match tree.children.get_mut(el) {
            Some(o) if o.is_leaf() || c.is_leaf() => true,
            Some(o) => {
                subtract(o, c);
                o.is_leaf()
            }
            None => false,
        };
        if drop {
            tree.children.remove(el);
        }
    }
}

fn relinquished(prev: &FieldsV1, next: &FieldsV1) -> Vec<FieldPath> {
    let mut out = Vec::new();
    walk_relinquished(prev, next, &FieldPath::root(), &mut out);
    out
}

fn walk_relinquished(prev: &FieldsV1, next: &FieldsV1, path: &FieldPath, out: &mut Vec<FieldPath>) {
    for (el, p) in prev.children.iter() {
        let here = path.child(el.clone());
        match next.children.get(el) {
            None if p.is_leaf() => out.push(here),
            None => out.extend(p.leaves(&here)),
            Some(n) if p.is_leaf() || n.is_leaf() => {}
            Some(n) => walk_relinquished(p, n, &here, out),
        }
    }
}

/// Delete each relinquished path from `dst`, then prune containers the removal left empty
/// unless one of `remaining` still owns them. Paths already absent are skipped.
pub fn purge_removed(dst: &mut Json, removed: &[FieldPath], remaining: &[FieldManager]) {
    for path in removed {
        if path.is_empty() || !remove_path(dst, &path.0) {
            continue;
        }
        for depth in (1..path.len()).rev() {
            let prefix = &path.0[..depth];
            if remaining.iter().any(|m| m.fields_v1.covers(prefix)) {
                break;
            }
            let empty = match lookup(dst, prefix) {
                Some(Json::Object(m)) => m.is_empty(),
                Some(Json::Array(a)) => a.is_empty(),
                _ => false,
            };
            if !empty {
                break;
            }
            remove_path(dst, prefix);
        }
    }
}

fn lookup<'a>(v: &'a Json, path: &[PathElement]) -> Option<&'a Json> {
    let mut cur = v;
    for el in path {
        cur = match (el, cur) {
            (PathElement::Field(name), Json::Object(m)) => m.get(name)?,
            (PathElement::Key(id), Json::Array(items)) => items.iter().find(|it| element_id(it) == Some(id.as_str()))?,
            _ => return None,
        };
    }
    Some(cur)
}

fn lookup_mut<'a>(v: &'a mut Json, path: &[PathElement]) -> Option<&'a mut Json> {
    let mut cur = v;
    for el in path {
        cur = match (el, cur) {
            (PathElement::Field(name), Json::Object(m)) => m.get_mut(name)?,
            (PathElement::Key(id), Json::Array(items)) => items.iter_mut().find(|it| element_id(it) == Some(id.as_str()))?,
            _ => return None,
        };
    }
    Some(cur)
}

fn remove_path(v: &mut Json, path: &[PathElement]) -> bool {
    let Some((last, parent)) = path.split_last() else { return false };
    match (last, lookup_mut(v, parent)) {
        (PathElement::Field(name), Some(Json::Object(m))) => m.remove(name).is_some(),
        (PathElement::Key(id), Some(Json::Array(items))) => {
            let before = items.len();
            items.retain(|it| element_id(it) != Some(id.as_str()));
            items.len() != before
        }
        _ => false,
    }
}

/// Deep-merge `src` into `dst` along `fields`. Members outside the tree are left alone;
/// keyed elements are matched by id, unmatched ones appended.
///
/// An empty root tree claims nothing, so `dst` is left untouched.
pub fn merge_objects(dst: &mut Json, src: &Json, fields: &FieldsV1) {
    if fields.is_leaf() {
        return;
    }
    merge_node(dst, src, fields);
}

fn merge_node(dst: &mut Json, src: &Json, fields: &FieldsV1) {
    if fields.is_leaf() {
        *dst = src.clone();
        return;
    }
    match src {
        Json::Object(src_map) => {
            if !dst.is_object() {
                *dst = Json::Object(serde_json::Map::new());
            }
            let Json::Object(dst_map) = dst else { return };
            for (el, child) in fields.children.iter() {
                let PathElement::Field(name) = el else { continue };
                let Some(sv) = src_map.get(name) else { continue };
                let slot = dst_map.entry(name.clone()).or_insert(Json::Null);
                merge_node(slot, sv, child);
            }
        }
        Json::Array(src_items) => {
            if !dst.is_array() {
                *dst = Json::Array(Vec::new());
            }
            let Json::Array(dst_items) = dst else { return };
            for sv in src_items {
                let Some(id) = element_id(sv) else { continue };
                let Some(child) = fields.children.get(&PathElement::Key(id.to_string())) else { continue };
                match dst_items.iter_mut().find(|d| element_id(d) == Some(id)) {
                    Some(dv) => merge_node(dv, sv, child),
                    None => dst_items.push(sv.clone()),
                }
            }
        }
        _ => *dst = src.clone(),
    }
}
