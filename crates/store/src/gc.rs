//! Cascading garbage collection of objects marked for deletion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use keel_core::{env_or, ignore_not_found, Error, Event, EventOperation, MetaOnly, ObjectKey, Outcome, Result};
use keel_watch::{EventHandler, Watcher, WatcherConfig};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Store;

pub const GC_DURABLE: &str = "keel-garbage-collector";

/// Owner chains deeper than this are treated as cycles.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Delay before looking again at an object that is not collectible yet.
    pub retry: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { retry: Duration::from_secs(5) }
    }
}

impl GcConfig {
    pub fn from_env() -> Self {
        Self { retry: Duration::from_secs(env_or("KEEL_GC_RETRY_SECS", 5)) }
    }
}

/// What a collection attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// The object and all its descendants were removed.
    Purged,
    /// Nothing stored under the key.
    Absent,
    /// The object is not marked for deletion.
    Live,
    /// Not collectible yet; look again after the delay.
    Blocked(Duration),
}

/// Remove `key` once its deletion time has passed, its finalizers are gone and every
/// child naming it as owner has been removed first. Unmarked children get marked.
pub async fn collect(store: &Store, key: &ObjectKey, retry: Duration) -> Result<Collection> {
    collect_at(store, key, retry, 0).await
}

fn collect_at<'a>(store: &'a Store, key: &'a ObjectKey, retry: Duration, depth: usize) -> BoxFuture<'a, Result<Collection>> {
    async move {
        if depth > MAX_DEPTH {
            return Err(Error::Internal(format!("{}: owner chain deeper than {}", key, MAX_DEPTH)));
        }
        let Some(obj) = ignore_not_found(store.get(key).await)? else {
            return Ok(Collection::Absent);
        };
        let meta = MetaOnly::from_json(&obj)?.metadata;
        let Some(at) = meta.deletion_timestamp else {
            return Ok(Collection::Live);
        };
        let now = Utc::now();
        if at > now {
            return Ok(Collection::Blocked((at - now).to_std().unwrap_or(retry)));
        }
        if !meta.finalizers.is_empty() {
            debug!(key = %key, finalizers = ?meta.finalizers, "waiting on finalizers");
            return Ok(Collection::Blocked(retry));
        }

        let mut blocked: Option<Duration> = None;
        for child in store.children(key).await? {
            let child_key = child.key();
            if !child.metadata.is_marked_for_deletion() {
                ignore_not_found(store.delete(&child_key, Duration::ZERO).await)?;
            }
            if let Collection::Blocked(d) = collect_at(store, &child_key, retry, depth + 1).await? {
                blocked = Some(blocked.map_or(d, |b| b.min(d)));
            }
        }
        if let Some(d) = blocked {
            debug!(key = %key, retry_ms = %d.as_millis(), "children still present");
            return Ok(Collection::Blocked(d));
        }

        store.purge(key).await?;
        counter!("gc_purged_total", 1u64);
        info!(key = %key, "gc: purged");
        Ok(Collection::Purged)
    }
    .boxed()
}

/// Watches every kind for objects marked for deletion and collects them.
pub struct GarbageCollector {
    store: Store,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(store: Store) -> Self {
        Self { store, config: GcConfig::from_env() }
    }

    pub fn with_config(mut self, config: GcConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the shared durable watch. Replicas split the work between them.
    pub async fn start(self, cancel: CancellationToken) -> Result<Watcher> {
        let kv = Arc::clone(self.store.kv());
        let cfg = WatcherConfig::all_kinds().durable(GC_DURABLE);
        info!(retry_secs = self.config.retry.as_secs(), "gc: starting");
        Watcher::start_with_cancel(kv, cfg, Arc::new(self), cancel).await
    }
}

#[async_trait]
impl EventHandler for GarbageCollector {
    async fn handle(&self, _cancel: CancellationToken, event: Event) -> Result<Outcome> {
        if event.operation != EventOperation::Delete {
            return Ok(Outcome::Done);
        }
        match collect(&self.store, &event.key, self.config.retry).await {
            Ok(Collection::Blocked(d)) => Ok(Outcome::RequeueAfter(d)),
            Ok(_) => Ok(Outcome::Done),
            Err(e) => {
                warn!(key = %event.key, error = %e, "gc: collection failed");
                Ok(Outcome::RequeueAfter(self.config.retry))
            }
        }
    }
}
