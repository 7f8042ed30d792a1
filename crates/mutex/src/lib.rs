//! Keel mutex: per-key, non-blocking locks stored in a TTL-bounded bucket.
//!
//! A held lock is a non-empty value at the key. Releasing writes an empty value so the next
//! locker can take it with a revision-checked update. Locks that are neither renewed nor
//! released disappear with the bucket TTL.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{Error, Result};
use keel_kv::{KeyValue, KvError};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct DistributedMutex {
    kv: Arc<dyn KeyValue>,
    ttl: Duration,
}

impl DistributedMutex {
    /// The bucket must expire entries, otherwise a crashed holder would keep its lock forever.
    pub fn new(kv: Arc<dyn KeyValue>) -> Result<Self> {
        let ttl = kv
            .ttl()
            .ok_or_else(|| Error::BadRequest(format!("mutex bucket {} has no ttl", kv.bucket())))?;
        Ok(Self { kv, ttl })
    }

    pub fn ttl(&self) -> Duration { self.ttl }

    /// Take the lock for `key` or fail with [`Error::Locked`]. Never waits.
    pub async fn lock(&self, key: &str) -> Result<Lock> {
        let token = uuid::Uuid::new_v4().to_string().into_bytes();
        let revision = match self.kv.get(key).await {
            Err(KvError::NotFound(_)) => self.kv.create(key, token.clone()).await.map_err(|e| contended(key, e))?,
            Ok(entry) if entry.value.is_empty() => {
                self.kv.update(key, token.clone(), entry.revision).await.map_err(|e| contended(key, e))?
            }
            Ok(_) => return Err(Error::Locked(key.to_string())),
            Err(e) => return Err(e.into()),
        };
        debug!(key, revision, "lock acquired");
        Ok(Lock {
            kv: Arc::clone(&self.kv),
            key: key.to_string(),
            token,
            state: tokio::sync::Mutex::new(LockState { revision, released: false }),
        })
    }
}

fn contended(key: &str, e: KvError) -> Error {
    match e {
        KvError::KeyExists(_) | KvError::WrongLastRevision { .. } => Error::Locked(key.to_string()),
        other => other.into(),
    }
}

struct LockState {
    revision: u64,
    released: bool,
}

/// A held lock.
pub struct Lock {
    kv: Arc<dyn KeyValue>,
    key: String,
    token: Vec<u8>,
    state: tokio::sync::Mutex<LockState>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Lock {
    pub fn key(&self) -> &str { &self.key }

    /// Rewrite the value to restart the TTL clock.
    pub async fn in_progress(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.released {
            return Ok(());
        }
        match self.kv.update(&self.key, self.token.clone(), st.revision).await {
            Ok(rev) => {
                st.revision = rev;
                Ok(())
            }
            Err(KvError::WrongLastRevision { .. }) => Err(Error::Locked(format!("{}: lock lost", self.key))),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock. Releasing twice is a no-op.
    pub async fn release(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.released {
            return Ok(());
        }
        st.released = true;
        match self.kv.update(&self.key, Vec::new(), st.revision).await {
            Ok(_) => Ok(()),
            Err(KvError::WrongLastRevision { .. }) => {
                warn!(key = %self.key, "lock expired before release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
