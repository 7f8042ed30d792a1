//! In-process bucket implementation.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use keel_core::subject;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::consumer::Shared;
use crate::{validate_key, BucketConfig, Consumer, ConsumerConfig, DeliverPolicy, Entry, Journal, KeyValue, KvError, Operation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Entry(Entry),
    /// Every entry that existed when the watch started has been replayed.
    CaughtUp,
}

/// Change stream over a pattern.
#[derive(Debug)]
pub struct Watch {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watch {
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

impl Stream for Watch {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Stored {
    entry: Entry,
    written: Instant,
}

#[derive(Default)]
struct State {
    seq: u64,
    latest: BTreeMap<String, Stored>,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    consumers: Vec<Weak<Shared>>,
    durables: FxHashMap<String, Arc<Shared>>,
}

struct Inner {
    config: BucketConfig,
    journal: Option<Arc<dyn Journal>>,
    state: Mutex<State>,
}

/// Bucket held in memory, optionally mirrored to a [`Journal`].
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl MemoryKv {
    pub fn new(config: BucketConfig) -> Self {
        Self { inner: Arc::new(Inner { config, journal: None, state: Mutex::new(State::default()) }) }
    }

    /// Open a bucket whose contents are restored from and mirrored to `journal`.
    pub fn with_journal(config: BucketConfig, journal: Arc<dyn Journal>) -> anyhow::Result<Self> {
        let loaded = journal.load(&config.name)?;
        let now = Instant::now();
        let mut state = State::default();
        for entry in loaded {
            state.seq = state.seq.max(entry.revision);
            state.latest.insert(entry.key.clone(), Stored { entry, written: now });
        }
        debug!(bucket = %config.name, keys = state.latest.len(), revision = state.seq, "bucket restored from journal");
        Ok(Self { inner: Arc::new(Inner { config, journal: Some(journal), state: Mutex::new(state) }) })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live<'a>(&self, s: &'a Stored, now: Instant) -> Option<&'a Entry> {
        if s.entry.operation != Operation::Put || self.expired(s, now) {
            return None;
        }
        Some(&s.entry)
    }

    fn expired(&self, s: &Stored, now: Instant) -> bool {
        self.inner.config.ttl.is_some_and(|ttl| now.duration_since(s.written) >= ttl)
    }

    /// Current revision of `key` including tombstones; expired entries count as absent.
    fn last_of(&self, st: &State, key: &str, now: Instant) -> Option<u64> {
        st.latest.get(key).filter(|s| !self.expired(s, now)).map(|s| s.entry.revision)
    }

    fn write(&self, st: &mut State, key: &str, value: Vec<u8>, operation: Operation) -> Result<u64, KvError> {
        let revision = st.seq + 1;
        let entry = Entry { key: key.to_string(), value, revision, operation, created: Utc::now() };
        if let Some(journal) = &self.inner.journal {
            let res = match operation {
                Operation::Purge => journal.remove(&self.inner.config.name, key),
                _ => journal.append(&self.inner.config.name, &entry),
            };
            if let Err(e) = res {
                warn!(bucket = %self.inner.config.name, key, error = %e, "journal write failed");
                return Err(KvError::Backend(e.to_string()));
            }
        }
        st.seq = revision;
        match operation {
            Operation::Purge => {
                st.latest.remove(key);
            }
            _ => {
                st.latest.insert(key.to_string(), Stored { entry: entry.clone(), written: Instant::now() });
            }
        }
        st.watchers.retain(|(pattern, tx)| {
            if !subject::matches(pattern, key) {
                return !tx.is_closed();
            }
            tx.send(WatchEvent::Entry(entry.clone())).is_ok()
        });
        st.consumers.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                if subject::matches(&shared.filter, key) {
                    shared.enqueue(entry.clone());
                }
                true
            }
            None => false,
        });
        Ok(revision)
    }

    /// Latest entries per matching key, tombstones included, ordered by revision.
    fn snapshot(&self, st: &State, pattern: &str, now: Instant) -> Vec<Entry> {
        let mut out: Vec<Entry> = st
            .latest
            .values()
            .filter(|s| !self.expired(s, now) && subject::matches(pattern, &s.entry.key))
            .map(|s| s.entry.clone())
            .collect();
        out.sort_by_key(|e| e.revision);
        out
    }
}

#[async_trait]
impl KeyValue for MemoryKv {
    fn bucket(&self) -> &str { &self.inner.config.name }

    fn ttl(&self) -> Option<Duration> { self.inner.config.ttl }

    async fn get(&self, key: &str) -> Result<Entry, KvError> {
        let st = self.lock();
        let now = Instant::now();
        st.latest
            .get(key)
            .and_then(|s| self.live(s, now))
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        validate_key(key)?;
        let mut st = self.lock();
        let now = Instant::now();
        if st.latest.get(key).and_then(|s| self.live(s, now)).is_some() {
            return Err(KvError::KeyExists(key.to_string()));
        }
        self.write(&mut st, key, value, Operation::Put)
    }

    async fn update(&self, key: &str, value: Vec<u8>, last: u64) -> Result<u64, KvError> {
        validate_key(key)?;
        let mut st = self.lock();
        let current = self.last_of(&st, key, Instant::now()).unwrap_or(0);
        if current != last {
            return Err(KvError::WrongLastRevision { key: key.to_string(), expected: last, current });
        }
        self.write(&mut st, key, value, Operation::Put)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        validate_key(key)?;
        let mut st = self.lock();
        self.write(&mut st, key, value, Operation::Put)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        let mut st = self.lock();
        self.write(&mut st, key, Vec::new(), Operation::Delete).map(|_| ())
    }

    async fn purge(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        let mut st = self.lock();
        self.write(&mut st, key, Vec::new(), Operation::Purge).map(|_| ())
    }

    async fn entries(&self, pattern: &str) -> Result<Vec<Entry>, KvError> {
        let st = self.lock();
        let now = Instant::now();
        Ok(st
            .latest
            .values()
            .filter(|s| subject::matches(pattern, &s.entry.key))
            .filter_map(|s| self.live(s, now).cloned())
            .collect())
    }

    async fn watch(&self, pattern: &str) -> Result<Watch, KvError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.lock();
        for entry in self.snapshot(&st, pattern, Instant::now()) {
            let _ = tx.send(WatchEvent::Entry(entry));
        }
        let _ = tx.send(WatchEvent::CaughtUp);
        st.watchers.push((pattern.to_string(), tx));
        Ok(Watch { rx })
    }

    async fn consumer(&self, config: ConsumerConfig) -> Result<Consumer, KvError> {
        let mut st = self.lock();
        let now = Instant::now();
        let backlog = self.snapshot(&st, &config.filter, now);
        let seeded_through = match config.deliver {
            DeliverPolicy::LastPerKey => backlog.last().map(|e| e.revision).unwrap_or(0),
            DeliverPolicy::New => 0,
        };
        if let Some(name) = &config.durable {
            if let Some(shared) = st.durables.get(name) {
                return Ok(Consumer { shared: Arc::clone(shared), seeded_through });
            }
        }
        let name = config.durable.clone().unwrap_or_else(|| format!("ephemeral-{}", st.consumers.len()));
        let shared = Shared::new(name.clone(), config.filter.clone(), config.ack_wait);
        if config.deliver == DeliverPolicy::LastPerKey {
            for entry in backlog {
                shared.enqueue(entry);
            }
        }
        st.consumers.push(Arc::downgrade(&shared));
        if config.durable.is_some() {
            st.durables.insert(name.clone(), Arc::clone(&shared));
        }
        debug!(bucket = %self.inner.config.name, consumer = %name, filter = %config.filter, seeded_through, "consumer attached");
        Ok(Consumer { shared, seeded_through })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> MemoryKv {
        MemoryKv::new(BucketConfig::new("test"))
    }

    #[tokio::test]
    async fn create_then_update_with_revision() {
        let kv = kv();
        let r1 = kv.create("w.t.a", b"1".to_vec()).await.unwrap();
        assert!(matches!(kv.create("w.t.a", b"2".to_vec()).await, Err(KvError::KeyExists(_))));
        let r2 = kv.update("w.t.a", b"2".to_vec(), r1).await.unwrap();
        assert!(r2 > r1);
        let err = kv.update("w.t.a", b"3".to_vec(), r1).await.unwrap_err();
        assert_eq!(err, KvError::WrongLastRevision { key: "w.t.a".into(), expected: r1, current: r2 });
        assert_eq!(kv.get("w.t.a").await.unwrap().value, b"2".to_vec());
    }

    #[tokio::test]
    async fn tombstones_read_as_missing_and_allow_create() {
        let kv = kv();
        kv.put("w.t.a", b"1".to_vec()).await.unwrap();
        kv.delete("w.t.a").await.unwrap();
        assert!(matches!(kv.get("w.t.a").await, Err(KvError::NotFound(_))));
        assert!(kv.entries("w.*.*").await.unwrap().is_empty());
        kv.create("w.t.a", b"again".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn wildcard_keys_are_rejected() {
        assert!(matches!(kv().put("w.*.a", vec![]).await, Err(KvError::InvalidKey(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new(BucketConfig::new("locks").with_ttl(Duration::from_secs(10)));
        kv.create("w.t.a", b"1".to_vec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(kv.get("w.t.a").await.is_err());
        kv.create("w.t.a", b"1".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn watch_replays_then_signals_caught_up() {
        let kv = kv();
        kv.put("w.t.a", b"1".to_vec()).await.unwrap();
        kv.put("x.t.b", b"1".to_vec()).await.unwrap();
        let mut w = kv.watch("w.*.*").await.unwrap();
        assert!(matches!(w.next().await, Some(WatchEvent::Entry(e)) if e.key == "w.t.a"));
        assert_eq!(w.next().await, Some(WatchEvent::CaughtUp));
        kv.delete("w.t.a").await.unwrap();
        assert!(matches!(w.next().await, Some(WatchEvent::Entry(e)) if e.operation == Operation::Delete));
    }
}
