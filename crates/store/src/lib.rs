//! Keel object store.
//!
//! Objects live in a revisioned bucket under `kind.account.name`. Writes go through
//! [`Store::apply`], which merges field ownership per manager and commits with a
//! compare-and-swap on the revision that was read. Deletion only stamps
//! `metadata.deletionTimestamp`; the [`GarbageCollector`] removes records once they are
//! collectible.

#![forbid(unsafe_code)]

mod client;
mod gc;
mod service;

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_apply::{extract, json_node_budget_exceeded, max_object_nodes, merge, merge_objects, purge_removed, FieldManager};
use keel_bus::{decode_reply, Bus, BusError, Message};
use keel_core::{defaults, env_or, is_valid_token, subject, Error, MetaOnly, ObjectKey, Result};
use keel_kv::{KeyValue, KvError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info};

pub use client::Client;
pub use gc::{collect, Collection, GarbageCollector, GcConfig, GC_DURABLE};
pub use service::{StoreService, STORE_QUEUE};

/// Manager the store itself applies under when marking objects for deletion.
pub const STORE_MANAGER: &str = "keel-store";

/// Body of a validation request; `old` is absent on create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Json>,
    pub new: Json,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub validate_timeout: Duration,
    pub max_object_nodes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { validate_timeout: defaults::VALIDATE_TIMEOUT, max_object_nodes: 100_000 }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            validate_timeout: Duration::from_millis(env_or(
                "KEEL_VALIDATE_TIMEOUT_MS",
                defaults::VALIDATE_TIMEOUT.as_millis() as u64,
            )),
            max_object_nodes: max_object_nodes(),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KeyValue>,
    bus: Option<Arc<dyn Bus>>,
    config: StoreConfig,
}

impl Store {
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv, bus: None, config: StoreConfig::from_env() }
    }

    /// Route create and update validation over `bus`.
    pub fn with_bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kv(&self) -> &Arc<dyn KeyValue> { &self.kv }

    pub async fn get(&self, key: &ObjectKey) -> Result<Json> {
        key.validate()?;
        let (obj, _) = self.read(key).await?;
        Ok(obj)
    }

    /// Objects matching `pattern`, ordered by key.
    pub async fn list(&self, pattern: &ObjectKey) -> Result<Vec<Json>> {
        pattern.validate_pattern()?;
        let entries = self.kv.entries(&pattern.to_string()).await?;
        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            out.push(with_revision(decode_stored(&e.key, &e.value)?, e.revision));
        }
        Ok(out)
    }

    /// Metadata of every object naming `owner` in its owner references.
    pub async fn children(&self, owner: &ObjectKey) -> Result<Vec<MetaOnly>> {
        let mut out = Vec::new();
        for obj in self.list(&ObjectKey::all()).await? {
            let meta = MetaOnly::from_json(&obj)?;
            if meta.metadata.is_owned_by(owner) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// Store `payload` as a new object. Fails with `Conflict` if the key exists.
    pub async fn create(&self, key: &ObjectKey, payload: Json) -> Result<Json> {
        key.validate()?;
        let mut obj = self.prepare(key, payload)?;
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
        self.insert(key, obj).await
    }

    /// Server-side apply: create the object, or merge `payload` into it as `manager`.
    ///
    /// Fields another manager owns are a `Conflict` unless `force` moves them to `manager`.
    /// A concurrent write between the read and the commit is also a `Conflict`; callers
    /// retry from a fresh read.
    pub async fn apply(&self, key: &ObjectKey, payload: Json, manager: &str, force: bool) -> Result<Json> {
        key.validate()?;
        if manager.is_empty() {
            return Err(Error::BadRequest("field manager is required".into()));
        }
        if !is_valid_token(manager) {
            return Err(Error::BadRequest(format!("invalid field manager {:?}", manager)));
        }
        let started = Instant::now();
        let payload = self.prepare(key, payload)?;
        let incoming = FieldManager::new(manager, extract(&payload));

        let (current, revision) = match self.read(key).await {
            Ok(found) => found,
            Err(Error::NotFound(_)) => {
                let mut obj = payload;
                let managers = if incoming.fields_v1.is_leaf() { Vec::new() } else { vec![incoming] };
                set_managers(&mut obj, &managers)?;
                let out = self.insert(key, obj).await?;
                counter!("store_apply_total", 1u64);
                info!(key = %key, manager, took_ms = %started.elapsed().as_millis(), "store: apply created");
                return Ok(out);
            }
            Err(e) => return Err(e),
        };

        let meta = MetaOnly::from_json(&current)?;
        let merged = match merge(&meta.metadata.managed_fields, incoming.clone(), force) {
            Ok(m) => m,
            Err(c) => {
                counter!("store_apply_conflict_total", 1u64);
                debug!(key = %key, manager, paths = ?c.paths(), "apply refused");
                return Err(Error::from(c).context(key));
            }
        };
        let mut next = strip_revision(current.clone());
        purge_removed(&mut next, &merged.removed, &merged.managers);
        merge_objects(&mut next, &payload, &incoming.fields_v1);
        set_managers(&mut next, &merged.managers)?;

        let old = strip_revision(current);
        if next == old {
            debug!(key = %key, manager, revision, "apply left object unchanged");
            return Ok(with_revision(next, revision));
        }
        self.validate(subject::validate_update(&key.kind), Some(&old), &next).await?;
        let bytes = serde_json::to_vec(&next).map_err(|e| Error::Internal(format!("encoding {}: {}", key, e)))?;
        let written = match self.kv.update(&key.to_string(), bytes, revision).await {
            Ok(rev) => rev,
            Err(KvError::WrongLastRevision { .. }) => {
                counter!("store_apply_conflict_total", 1u64);
                return Err(Error::Conflict(format!(
                    "{} was modified concurrently since revision {}, please try again",
                    key, revision
                )));
            }
            Err(e) => return Err(Error::from(e).context(key)),
        };
        counter!("store_apply_total", 1u64);
        histogram!("store_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(key = %key, manager, force, revision = written, took_ms = %started.elapsed().as_millis(), "store: apply ok");
        Ok(with_revision(next, written))
    }

    /// Replace the object wholesale if it is still at `revision`.
    ///
    /// The managed-fields ledger is carried over when `payload` has none. A stale
    /// `revision` is a `Conflict`.
    pub async fn update(&self, key: &ObjectKey, payload: Json, revision: u64) -> Result<Json> {
        key.validate()?;
        let mut next = self.prepare(key, payload)?;
        let (current, _) = self.read(key).await?;
        let old = strip_revision(current);
        let has_ledger = next.pointer("/metadata/managedFields").is_some();
        if !has_ledger {
            if let Some(ledger) = old.pointer("/metadata/managedFields").cloned() {
                if let Some(meta) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.insert("managedFields".into(), ledger);
                }
            }
        }
        self.validate(subject::validate_update(&key.kind), Some(&old), &next).await?;
        let bytes = serde_json::to_vec(&next).map_err(|e| Error::Internal(format!("encoding {}: {}", key, e)))?;
        let written = match self.kv.update(&key.to_string(), bytes, revision).await {
            Ok(rev) => rev,
            Err(KvError::WrongLastRevision { current, .. }) => {
                return Err(Error::Conflict(format!(
                    "{} is at revision {}, not {}, please try again",
                    key, current, revision
                )));
            }
            Err(e) => return Err(Error::from(e).context(key)),
        };
        info!(key = %key, revision = written, "store: update ok");
        Ok(with_revision(next, written))
    }

    /// Mark the object for deletion `grace` from now. Already-marked objects are left alone.
    pub async fn delete(&self, key: &ObjectKey, grace: Duration) -> Result<()> {
        key.validate()?;
        let (current, _) = self.read(key).await?;
        if MetaOnly::from_json(&current)?.metadata.is_marked_for_deletion() {
            debug!(key = %key, "already marked for deletion");
            return Ok(());
        }
        let grace = chrono::Duration::from_std(grace).map_err(|e| Error::BadRequest(format!("grace period: {}", e)))?;
        let at = chrono::Utc::now() + grace;
        let patch = json!({ "metadata": { "deletionTimestamp": at } });
        self.apply(key, patch, STORE_MANAGER, true).await?;
        info!(key = %key, at = %at, "store: marked for deletion");
        Ok(())
    }

    /// Remove the record outright. Purging a missing key is a no-op.
    pub async fn purge(&self, key: &ObjectKey) -> Result<()> {
        key.validate()?;
        self.kv.purge(&key.to_string()).await?;
        debug!(key = %key, "purged");
        Ok(())
    }

    async fn read(&self, key: &ObjectKey) -> Result<(Json, u64)> {
        let entry = self.kv.get(&key.to_string()).await?;
        let obj = decode_stored(&entry.key, &entry.value)?;
        Ok((with_revision(obj, entry.revision), entry.revision))
    }

    async fn insert(&self, key: &ObjectKey, obj: Json) -> Result<Json> {
        self.validate(subject::validate_create(&key.kind), None, &obj).await?;
        let bytes = serde_json::to_vec(&obj).map_err(|e| Error::Internal(format!("encoding {}: {}", key, e)))?;
        let revision = match self.kv.create(&key.to_string(), bytes).await {
            Ok(rev) => rev,
            Err(KvError::KeyExists(_)) => return Err(Error::Conflict(format!("{} already exists", key))),
            Err(e) => return Err(Error::from(e).context(key)),
        };
        debug!(key = %key, revision, "created");
        Ok(with_revision(obj, revision))
    }

    /// Pin identity members to `key` and reject oversized or malformed payloads.
    fn prepare(&self, key: &ObjectKey, mut payload: Json) -> Result<Json> {
        if json_node_budget_exceeded(&payload, self.config.max_object_nodes) {
            return Err(Error::BadRequest(format!(
                "{}: object exceeds {} JSON nodes",
                key, self.config.max_object_nodes
            )));
        }
        let Json::Object(map) = &mut payload else {
            return Err(Error::BadRequest(format!("{}: payload must be a JSON object", key)));
        };
        if let Some(kind) = map.get("kind").and_then(|k| k.as_str()) {
            if kind != key.kind {
                return Err(Error::BadRequest(format!("{}: payload kind {:?} does not match", key, kind)));
            }
        }
        map.insert("kind".into(), Json::from(key.kind.clone()));
        let meta = map.entry("metadata").or_insert_with(|| json!({}));
        let Json::Object(meta) = meta else {
            return Err(Error::BadRequest(format!("{}: metadata must be an object", key)));
        };
        for (field, want) in [("name", &key.name), ("account", &key.account)] {
            if let Some(got) = meta.get(field).and_then(|v| v.as_str()).filter(|got| *got != want.as_str()) {
                return Err(Error::BadRequest(format!("{}: metadata.{} {:?} does not match", key, field, got)));
            }
            meta.insert(field.into(), Json::from(want.clone()));
        }
        meta.remove("revision");
        Ok(payload)
    }

    /// Ask a registered validator about a write. No validator means the write is allowed.
    async fn validate(&self, subject: String, old: Option<&Json>, new: &Json) -> Result<()> {
        let Some(bus) = &self.bus else { return Ok(()) };
        let body = serde_json::to_vec(&ValidateRequest { old: old.cloned(), new: new.clone() })
            .map_err(|e| Error::Internal(format!("encoding validation request: {}", e)))?;
        match bus.request(Message::new(subject.clone(), body), self.config.validate_timeout).await {
            Ok(reply) => match decode_reply(reply) {
                Ok(_) => Ok(()),
                Err(e) => {
                    debug!(subject = %subject, error = %e, "validator rejected write");
                    Err(Error::Validation(e.message().to_string()))
                }
            },
            Err(BusError::NoResponders(_)) => Ok(()),
            Err(e) => Err(Error::from(e).context("validating write")),
        }
    }
}

fn decode_stored(key: &str, bytes: &[u8]) -> Result<Json> {
    serde_json::from_slice(bytes).map_err(|e| Error::Internal(format!("decoding stored {}: {}", key, e)))
}

fn with_revision(mut obj: Json, revision: u64) -> Json {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("revision".into(), Json::from(revision));
    }
    obj
}

fn strip_revision(mut obj: Json) -> Json {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("revision");
    }
    obj
}

fn set_managers(obj: &mut Json, managers: &[FieldManager]) -> Result<()> {
    let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
        return Err(Error::Internal("object has no metadata".into()));
    };
    if managers.is_empty() {
        meta.remove("managedFields");
    } else {
        let encoded = serde_json::to_value(managers).map_err(|e| Error::Internal(format!("encoding managed fields: {}", e)))?;
        meta.insert("managedFields".into(), encoded);
    }
    Ok(())
}
