//! FieldsV1 ownership trees and their `f:`/`k:` wire encoding.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use smallvec::SmallVec;

/// Merge key used to address array elements.
pub const MERGE_KEY: &str = "id";

/// Only supported `fieldsType`.
pub const FIELDS_TYPE_V1: &str = "FieldsV1";

/// One step in a field tree: an object member or a keyed array element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathElement {
    Field(String),
    Key(String),
}

impl PathElement {
    fn encode(&self) -> String {
        match self {
            PathElement::Field(name) => format!("f:{}", name),
            PathElement::Key(id) => {
                let mut m = serde_json::Map::new();
                m.insert(MERGE_KEY.to_string(), Json::String(id.clone()));
                format!("k:{}", Json::Object(m))
            }
        }
    }

    fn decode(raw: &str) -> Result<Self, String> {
        if let Some(name) = raw.strip_prefix("f:") {
            return Ok(PathElement::Field(name.to_string()));
        }
        if let Some(body) = raw.strip_prefix("k:") {
            let v: Json = serde_json::from_str(body).map_err(|e| format!("invalid element key {}: {}", raw, e))?;
            return match v.get(MERGE_KEY).and_then(|id| id.as_str()) {
                Some(id) => Ok(PathElement::Key(id.to_string())),
                None => Err(format!("element key {} has no string {}", raw, MERGE_KEY)),
            };
        }
        Err(format!("unknown path element {}", raw))
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Field(name) => write!(f, "{}", name),
            PathElement::Key(id) => write!(f, "[{}={}]", MERGE_KEY, id),
        }
    }
}

/// Absolute path from the object root, e.g. `spec.items[id=a].port`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(pub SmallVec<[PathElement; 8]>);

impl FieldPath {
    pub fn root() -> Self { Self::default() }

    pub fn child(&self, el: PathElement) -> Self {
        let mut next = self.clone();
        next.0.push(el);
        next
    }

    /// Parse a dotted path of plain field names (`spec.x`).
    pub fn fields(dotted: &str) -> Self {
        FieldPath(dotted.split('.').filter(|s| !s.is_empty()).map(|s| PathElement::Field(s.to_string())).collect())
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for el in self.0.iter() {
            match el {
                PathElement::Field(_) if !first => write!(f, ".{}", el)?,
                _ => write!(f, "{}", el)?,
            }
            first = false;
        }
        Ok(())
    }
}

/// Ownership tree. A node without children is a leaf: its owner holds the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldsV1 {
    pub children: BTreeMap<PathElement, FieldsV1>,
}

impl FieldsV1 {
    pub fn leaf() -> Self { Self::default() }

    pub fn is_leaf(&self) -> bool { self.children.is_empty() }

    /// Node at `path`, if the tree reaches that far.
    pub fn get(&self, path: &[PathElement]) -> Option<&FieldsV1> {
        let mut node = self;
        for el in path {
            node = node.children.get(el)?;
        }
        Some(node)
    }

    /// Node at a dotted path of plain fields.
    pub fn get_fields(&self, dotted: &str) -> Option<&FieldsV1> {
        self.get(&FieldPath::fields(dotted).0)
    }

    /// True when the tree reaches `path` or a leaf that covers it.
    pub fn covers(&self, path: &[PathElement]) -> bool {
        let mut node = self;
        for el in path {
            match node.children.get(el) {
                Some(next) if next.is_leaf() => return true,
                Some(next) => node = next,
                None => return false,
            }
        }
        true
    }

    /// All leaf paths below this node, prefixed by `base`.
    pub fn leaves(&self, base: &FieldPath) -> Vec<FieldPath> {
        let mut out = Vec::new();
        collect_leaves(self, base, &mut out);
        out
    }
}

fn collect_leaves(node: &FieldsV1, path: &FieldPath, out: &mut Vec<FieldPath>) {
    if node.is_leaf() {
        if !path.is_empty() {
            out.push(path.clone());
        }
        return;
    }
    for (el, child) in node.children.iter() {
        collect_leaves(child, &path.child(el.clone()), out);
    }
}

impl Serialize for FieldsV1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.children.len()))?;
        for (el, child) in self.children.iter() {
            map.serialize_entry(&el.encode(), child)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldsV1 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: BTreeMap<String, FieldsV1> = BTreeMap::deserialize(deserializer)?;
        let mut children = BTreeMap::new();
        for (k, v) in raw {
            // "." marks a node that is both owned and has children; ownership of the node is implied.
            if k == "." {
                continue;
            }
            children.insert(PathElement::decode(&k).map_err(D::Error::custom)?, v);
        }
        Ok(FieldsV1 { children })
    }
}

/// A writer and the fields it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldManager {
    pub manager: String,
    #[serde(default = "fields_type_v1")]
    pub fields_type: String,
    #[serde(default, rename = "fieldsV1")]
    pub fields_v1: FieldsV1,
}

fn fields_type_v1() -> String { FIELDS_TYPE_V1.to_string() }

impl FieldManager {
    pub fn new(manager: impl Into<String>, fields_v1: FieldsV1) -> Self {
        Self { manager: manager.into(), fields_type: fields_type_v1(), fields_v1 }
    }
}

/// Top-level members never owned by anyone.
const IDENTITY_FIELDS: [&str; 2] = ["kind", "apiVersion"];
/// Metadata members that identify the object or are maintained by the store.
const IDENTITY_META_FIELDS: [&str; 4] = ["name", "account", "revision", "managedFields"];

/// Build the ownership tree for `payload`, minus identity and store-maintained fields.
pub fn extract(payload: &Json) -> FieldsV1 {
    let mut tree = build(payload);
    for f in IDENTITY_FIELDS {
        tree.children.remove(&PathElement::Field(f.to_string()));
    }
    let meta_key = PathElement::Field("metadata".to_string());
    let drop_meta = match tree.children.get_mut(&meta_key) {
        Some(meta) if !meta.is_leaf() => {
            for f in IDENTITY_META_FIELDS {
                meta.children.remove(&PathElement::Field(f.to_string()));
            }
            meta.is_leaf()
        }
        Some(_) => true,
        None => false,
    };
    if drop_meta {
        tree.children.remove(&meta_key);
    }
    tree
}

fn build(v: &Json) -> FieldsV1 {
    match v {
        Json::Object(map) => FieldsV1 {
            children: map.iter().map(|(k, vv)| (PathElement::Field(k.clone()), build(vv))).collect(),
        },
        Json::Array(items) if is_keyed(items) => FieldsV1 {
            children: items
                .iter()
                .filter_map(|it| element_id(it).map(|id| (PathElement::Key(id.to_string()), build(it))))
                .collect(),
        },
        _ => FieldsV1::leaf(),
    }
}

/// Arrays are keyed when non-empty and every element is an object with a string merge key.
pub(crate) fn is_keyed(items: &[Json]) -> bool {
    !items.is_empty() && items.iter().all(|it| element_id(it).is_some())
}

pub(crate) fn element_id(v: &Json) -> Option<&str> {
    v.as_object()?.get(MERGE_KEY)?.as_str()
}
