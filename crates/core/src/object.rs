use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_apply::FieldManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::key::ObjectKey;

/// Weak back-reference from a child to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub account: String,
    pub name: String,
}

impl OwnerReference {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.account, &self.name)
    }
}

impl From<&ObjectKey> for OwnerReference {
    fn from(k: &ObjectKey) -> Self {
        Self { kind: k.kind.clone(), account: k.account.clone(), name: k.name.clone() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Assigned by the store on read; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_fields: Vec<FieldManager>,
}

impl ObjectMeta {
    pub fn is_owned_by(&self, owner: &ObjectKey) -> bool {
        self.owner_references.iter().any(|r| r.kind == owner.kind && r.account == owner.account && r.name == owner.name)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Typed object envelope. `S` and `T` default to raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize, T: Serialize",
    deserialize = "S: DeserializeOwned + Default, T: DeserializeOwned + Default"
))]
pub struct Object<S = Json, T = Json> {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: S,
    #[serde(default)]
    pub status: T,
}

impl<S, T> Object<S, T> {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.metadata.account, &self.metadata.name)
    }
}

/// Envelope without spec or status, for code that only inspects metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaOnly {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl MetaOnly {
    pub fn from_json(v: &Json) -> Result<Self> {
        MetaOnly::deserialize(v).map_err(|e| Error::BadRequest(format!("invalid object metadata: {}", e)))
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.metadata.account, &self.metadata.name)
    }
}

/// Decode stored bytes into a typed object.
pub fn decode<O: DeserializeOwned>(bytes: &[u8]) -> Result<O> {
    serde_json::from_slice(bytes).map_err(|e| Error::Internal(format!("decoding stored object: {}", e)))
}
