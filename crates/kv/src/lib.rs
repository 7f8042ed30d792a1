//! Keel KV substrate: per-key revisioned buckets with watches and durable ack/nak consumers.
//!
//! Keys are dotted (`kind.account.name`); patterns use `*` per token and a trailing `>`.
//! Every write gets the next bucket-wide revision, so a revision doubles as a stream sequence.

#![forbid(unsafe_code)]

mod consumer;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use consumer::{Consumer, Delivery};
pub use memory::{MemoryKv, Watch, WatchEvent};

pub const BUCKET_OBJECTS: &str = "keel_objects";
pub const BUCKET_MUTEX: &str = "keel_objects_mutex";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
    Delete,
    Purge,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "PUT",
            Operation::Delete => "DEL",
            Operation::Purge => "PURGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUT" => Some(Operation::Put),
            "DEL" => Some(Operation::Delete),
            "PURGE" => Some(Operation::Purge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
    pub operation: Operation,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key exists: {0}")]
    KeyExists(String),
    #[error("wrong last revision for {key}: expected {expected}, current {current}")]
    WrongLastRevision { key: String, expected: u64, current: u64 },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl From<KvError> for keel_core::Error {
    fn from(e: KvError) -> Self {
        use keel_core::Error;
        match e {
            KvError::NotFound(k) => Error::NotFound(k),
            KvError::KeyExists(k) => Error::Conflict(format!("{} already exists", k)),
            e @ KvError::WrongLastRevision { .. } => Error::Conflict(e.to_string()),
            KvError::InvalidKey(k) => Error::BadRequest(format!("invalid key {}", k)),
            KvError::Backend(m) => Error::Internal(m),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub name: String,
    /// Entries not rewritten within this window read as absent.
    pub ttl: Option<Duration>,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Start from the latest entry of every matching key, tombstones included.
    #[default]
    LastPerKey,
    /// Only writes made after the consumer was created.
    New,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumers sharing a durable name share one queue, so each entry goes to one of them.
    pub durable: Option<String>,
    pub filter: String,
    pub deliver: DeliverPolicy,
    /// Unacknowledged deliveries are redelivered after this long.
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    pub fn new(filter: impl Into<String>) -> Self {
        Self { durable: None, filter: filter.into(), deliver: DeliverPolicy::LastPerKey, ack_wait: Duration::from_secs(30) }
    }

    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable = Some(name.into());
        self
    }

    pub fn ack_wait(mut self, d: Duration) -> Self {
        self.ack_wait = d;
        self
    }

    pub fn deliver(mut self, p: DeliverPolicy) -> Self {
        self.deliver = p;
        self
    }
}

/// Revisioned key-value bucket.
#[async_trait]
pub trait KeyValue: Send + Sync {
    fn bucket(&self) -> &str;

    fn ttl(&self) -> Option<Duration>;

    /// Latest live value. Tombstoned and expired keys are `NotFound`.
    async fn get(&self, key: &str) -> Result<Entry, KvError>;

    /// Write only if the key has no live value.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Write only if the key's latest revision is `last`.
    async fn update(&self, key: &str, value: Vec<u8>, last: u64) -> Result<u64, KvError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Leave a tombstone.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Remove the key and its history.
    async fn purge(&self, key: &str) -> Result<(), KvError>;

    /// Live entries matching `pattern`, ordered by key.
    async fn entries(&self, pattern: &str) -> Result<Vec<Entry>, KvError>;

    /// Replay the latest entry per matching key, signal catch-up, then stream live writes.
    async fn watch(&self, pattern: &str) -> Result<Watch, KvError>;

    async fn consumer(&self, config: ConsumerConfig) -> Result<Consumer, KvError>;
}

#[async_trait]
impl<T: KeyValue + ?Sized> KeyValue for Arc<T> {
    fn bucket(&self) -> &str { (**self).bucket() }
    fn ttl(&self) -> Option<Duration> { (**self).ttl() }
    async fn get(&self, key: &str) -> Result<Entry, KvError> { (**self).get(key).await }
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> { (**self).create(key, value).await }
    async fn update(&self, key: &str, value: Vec<u8>, last: u64) -> Result<u64, KvError> { (**self).update(key, value, last).await }
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> { (**self).put(key, value).await }
    async fn delete(&self, key: &str) -> Result<(), KvError> { (**self).delete(key).await }
    async fn purge(&self, key: &str) -> Result<(), KvError> { (**self).purge(key).await }
    async fn entries(&self, pattern: &str) -> Result<Vec<Entry>, KvError> { (**self).entries(pattern).await }
    async fn watch(&self, pattern: &str) -> Result<Watch, KvError> { (**self).watch(pattern).await }
    async fn consumer(&self, config: ConsumerConfig) -> Result<Consumer, KvError> { (**self).consumer(config).await }
}

/// Durable log behind a bucket. Implementations keep the latest entry per key.
pub trait Journal: Send + Sync {
    fn load(&self, bucket: &str) -> anyhow::Result<Vec<Entry>>;
    fn append(&self, bucket: &str, entry: &Entry) -> anyhow::Result<()>;
    fn remove(&self, bucket: &str, key: &str) -> anyhow::Result<()>;
}

/// Keys are dotted tokens without wildcards or whitespace.
pub(crate) fn validate_key(key: &str) -> Result<(), KvError> {
    let ok = !key.is_empty()
        && key.split('.').all(|t| !t.is_empty() && t != "*" && t != ">" && !t.chars().any(char::is_whitespace));
    if ok { Ok(()) } else { Err(KvError::InvalidKey(key.to_string())) }
}
