//! Keel controllers.
//!
//! A controller consumes change notifications for one kind (and for the child kinds it
//! owns), drops notifications a newer write has superseded, takes the per-object
//! distributed lock and runs the [`Reconciler`]. At most one reconciliation per object runs
//! at a time across every replica.

#![forbid(unsafe_code)]

mod controller;
mod validate;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_bus::Bus;
use keel_core::{defaults, env_or, Outcome, Request, Result};
use keel_kv::{BucketConfig, KeyValue, MemoryKv, BUCKET_MUTEX, BUCKET_OBJECTS};
use keel_mutex::DistributedMutex;
use keel_store::Store;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

pub use controller::{backoff, Controller, ControllerHandle};
pub use validate::serve_validator;

/// Convergence logic for one kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, cancel: CancellationToken, req: Request) -> Result<Outcome>;
}

/// Adapter turning an async closure into a [`Reconciler`].
pub struct FnReconciler<F>(pub F);

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(CancellationToken, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    async fn reconcile(&self, cancel: CancellationToken, req: Request) -> Result<Outcome> {
        (self.0)(cancel, req).await
    }
}

/// Admission check run by the store before writes of one kind.
#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn validate_create(&self, _new: &Json) -> Result<()> {
        Ok(())
    }

    async fn validate_update(&self, _old: &Json, _new: &Json) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Hard limit for a single reconcile call.
    pub reconcile_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Redelivery delay when another replica holds the object's lock.
    pub lock_retry: Duration,
    pub stop_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(3600),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(24 * 3600),
            lock_retry: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            reconcile_timeout: Duration::from_secs(env_or("KEEL_RECONCILE_TIMEOUT_SECS", d.reconcile_timeout.as_secs())),
            backoff_base: Duration::from_millis(env_or(
                "KEEL_RECONCILE_BACKOFF_BASE_MS",
                d.backoff_base.as_millis() as u64,
            )),
            stop_timeout: Duration::from_secs(env_or("KEEL_STOP_TIMEOUT_SECS", d.stop_timeout.as_secs())),
            ..d
        }
    }
}

/// Shared substrate handles a controller runs against.
#[derive(Clone)]
pub struct Runtime {
    pub objects: Arc<dyn KeyValue>,
    pub mutex: DistributedMutex,
    pub store: Store,
    pub bus: Option<Arc<dyn Bus>>,
}

impl Runtime {
    pub fn new(objects: Arc<dyn KeyValue>, mutex: DistributedMutex, bus: Option<Arc<dyn Bus>>) -> Self {
        let mut store = Store::new(Arc::clone(&objects));
        if let Some(b) = &bus {
            store = store.with_bus(Arc::clone(b));
        }
        Self { objects, mutex, store, bus }
    }

    /// In-process buckets; the mutex TTL comes from `KEEL_MUTEX_TTL_SECS`.
    pub fn in_memory(bus: Option<Arc<dyn Bus>>) -> Result<Self> {
        let ttl = Duration::from_secs(env_or("KEEL_MUTEX_TTL_SECS", defaults::MUTEX_TTL.as_secs()));
        let objects: Arc<dyn KeyValue> = Arc::new(MemoryKv::new(BucketConfig::new(BUCKET_OBJECTS)));
        let locks = MemoryKv::new(BucketConfig::new(BUCKET_MUTEX).with_ttl(ttl));
        let mutex = DistributedMutex::new(Arc::new(locks))?;
        Ok(Self::new(objects, mutex, bus))
    }
}
