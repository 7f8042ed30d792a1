//! Read-side object cache: coalesces watch entries by key and publishes immutable snapshots.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use keel_core::{ObjectKey, Result};
use keel_kv::{Entry, KeyValue, Operation, WatchEvent};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coalescing queue keyed by object key with FIFO order.
///
/// Nothing is ever evicted. `cap` is the queue length at which the owner should flush.
pub struct Coalescer {
    map: FxHashMap<String, Entry>,
    order: VecDeque<String>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.order.len() >= self.cap }

    /// Queue an entry; a newer entry for a queued key replaces it in place.
    pub fn push(&mut self, e: Entry) {
        if !self.map.contains_key(&e.key) {
            self.order.push_back(e.key.clone());
        }
        self.map.insert(e.key.clone(), e);
    }

    pub fn drain_ready(&mut self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(e) = self.map.remove(&key) {
                out.push(e);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    /// Objects ordered by key, each with `metadata.revision` set.
    pub items: Vec<(ObjectKey, Json)>,
}

impl CacheSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&Json> {
        self.items.binary_search_by(|(k, _)| k.cmp(key)).ok().map(|i| &self.items[i].1)
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// Folds entry batches into the object set and freezes snapshots.
#[derive(Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    items: FxHashMap<ObjectKey, Json>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn apply(&mut self, batch: Vec<Entry>) {
        for e in batch {
            let key: ObjectKey = match e.key.parse() {
                Ok(k) => k,
                Err(err) => {
                    warn!(key = %e.key, error = %err, "cache skipping malformed key");
                    continue;
                }
            };
            match e.operation {
                Operation::Put => match serde_json::from_slice::<Json>(&e.value) {
                    Ok(mut v) => {
                        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                            meta.insert("revision".into(), Json::from(e.revision));
                        }
                        self.items.insert(key, v);
                    }
                    Err(err) => warn!(key = %e.key, error = %err, "cache skipping undecodable object"),
                },
                Operation::Delete | Operation::Purge => {
                    self.items.remove(&key);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        let mut items: Vec<(ObjectKey, Json)> = self.items.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Arc::new(CacheSnapshot { epoch: self.epoch, items })
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    ready_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Resolve once the objects present at start are in the snapshot.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|r| *r).await;
    }

    pub fn stop(&self) { self.cancel.cancel(); }
}

/// Watch `pattern` and keep a snapshot of matching objects.
///
/// `cap` bounds how many keys queue up before a snapshot is published early.
pub async fn spawn_cache(kv: Arc<dyn KeyValue>, pattern: &ObjectKey, cap: usize) -> Result<CacheHandle> {
    pattern.validate_pattern()?;
    let mut stream = kv.watch(&pattern.to_string()).await?;
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (ready_tx, ready_rx) = watch::channel(false);
    let cancel = CancellationToken::new();
    let snap_clone = Arc::clone(&snap);
    let loop_cancel = cancel.clone();
    let pattern_s = pattern.to_string();

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = SnapshotBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        let flush = |coalescer: &mut Coalescer, builder: &mut SnapshotBuilder| {
            let batch = coalescer.drain_ready();
            if !batch.is_empty() {
                builder.apply(batch);
                let next = builder.freeze();
                let epoch = next.epoch;
                snap_clone.store(next);
                let _ = epoch_tx.send(epoch);
            }
        };
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                maybe = stream.next() => match maybe {
                    Some(WatchEvent::Entry(e)) => {
                        coalescer.push(e);
                        if coalescer.is_full() {
                            flush(&mut coalescer, &mut builder);
                        }
                    }
                    Some(WatchEvent::CaughtUp) => {
                        flush(&mut coalescer, &mut builder);
                        let _ = ready_tx.send(true);
                        debug!(pattern = %pattern_s, objects = snap_clone.load().len(), "cache caught up");
                    }
                    None => {
                        flush(&mut coalescer, &mut builder);
                        break;
                    }
                },
                _ = ticker.tick() => flush(&mut coalescer, &mut builder),
            }
        }
        info!(pattern = %pattern_s, "cache loop stopped");
    });

    Ok(CacheHandle { snap, epoch_rx, ready_rx, cancel })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn put(key: &str, rev: u64, name: &str) -> Entry {
        let body = serde_json::json!({ "kind": "w", "metadata": { "name": name } });
        Entry { key: key.into(), value: serde_json::to_vec(&body).unwrap(), revision: rev, operation: Operation::Put, created: Utc::now() }
    }

    #[test]
    fn coalescer_keeps_latest_per_key_in_first_seen_order() {
        let mut c = Coalescer::with_capacity(8);
        c.push(put("w.t.a", 1, "a"));
        c.push(put("w.t.b", 2, "b"));
        c.push(put("w.t.a", 3, "a2"));
        let out = c.drain_ready();
        assert_eq!(out.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![3, 2]);
        assert!(c.is_empty());
    }

    #[test]
    fn coalescer_never_evicts_past_capacity() {
        let mut c = Coalescer::with_capacity(1);
        c.push(put("w.t.a", 1, "a"));
        assert!(c.is_full());
        c.push(put("w.t.b", 2, "b"));
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert_eq!(out.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(), vec!["w.t.a", "w.t.b"]);
        assert!(!c.is_full());
    }

    #[test]
    fn builder_replays_puts_and_deletes() {
        let mut b = SnapshotBuilder::new();
        b.apply(vec![put("w.t.a", 1, "a"), put("w.t.b", 2, "b")]);
        let s1 = b.freeze();
        assert_eq!((s1.epoch, s1.len()), (1, 2));
        let tomb = Entry { operation: Operation::Delete, value: vec![], ..put("w.t.b", 3, "b") };
        b.apply(vec![put("w.t.a", 4, "a2"), tomb]);
        let s2 = b.freeze();
        assert_eq!(s2.epoch, 2);
        let a = s2.get(&ObjectKey::new("w", "t", "a")).unwrap();
        assert_eq!(a["metadata"]["name"], "a2");
        assert_eq!(a["metadata"]["revision"], 4);
        assert!(s2.get(&ObjectKey::new("w", "t", "b")).is_none());
    }
}
