use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::key::ObjectKey;

/// What a reconciler or watch handler wants done with the delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge; nothing more until the object changes again.
    #[default]
    Done,
    /// Redeliver immediately.
    Requeue,
    /// Redeliver after the given delay.
    RequeueAfter(Duration),
}

/// A reconciliation request for one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub key: ObjectKey,
}

impl Request {
    pub fn new(key: ObjectKey) -> Self { Self { key } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOperation {
    Put,
    /// Marked for deletion and still readable.
    Delete,
    /// Removed from the store.
    Purge,
}

/// Semantic change derived from a raw KV operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub operation: EventOperation,
    pub key: ObjectKey,
    pub revision: u64,
    #[serde(default)]
    pub data: Json,
}
