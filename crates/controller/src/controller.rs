use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::{ignore_not_found, is_valid_token, Error, MetaOnly, ObjectKey, Outcome, Request, Result};
use keel_kv::{Consumer, ConsumerConfig, Delivery, DeliverPolicy, KvError, Operation};
use keel_mutex::Lock;
use keel_store::{collect, Collection, GcConfig};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::validate::serve_validator;
use crate::{ControllerConfig, Reconciler, Runtime, Validator};

/// Redelivery delay after the `attempt`-th failed delivery: `base * 2^(attempt-1)`, capped.
pub fn backoff(base: Duration, attempt: u64, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31) as u32;
    base.saturating_mul(1u32 << exp).min(cap)
}

/// Where a delivery came from.
#[derive(Debug, Clone)]
enum Source {
    Owned,
    /// A child kind; the request goes to the owner of the controller's kind.
    Child(String),
}

/// Builder for a controller over one kind.
pub struct Controller {
    kind: String,
    reconciler: Arc<dyn Reconciler>,
    owns: Vec<String>,
    validator: Option<Arc<dyn Validator>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(kind: impl Into<String>, reconciler: Arc<dyn Reconciler>) -> Self {
        Self { kind: kind.into(), reconciler, owns: Vec::new(), validator: None, config: ControllerConfig::from_env() }
    }

    /// Reconcile the owner whenever an object of `child_kind` it owns changes.
    pub fn owns(mut self, child_kind: impl Into<String>) -> Self {
        self.owns.push(child_kind.into());
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn start(self, rt: &Runtime) -> Result<ControllerHandle> {
        if !is_valid_token(&self.kind) {
            return Err(Error::BadRequest(format!("invalid controller kind {:?}", self.kind)));
        }
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ack_wait = rt.mutex.ttl();

        if let Some(v) = &self.validator {
            match &rt.bus {
                Some(bus) => serve_validator(Arc::clone(bus), &self.kind, Arc::clone(v), cancel.clone(), &tracker).await?,
                None => warn!(kind = %self.kind, "validator registered without a bus; not serving"),
            }
        }

        let inner = Arc::new(Inner {
            kind: self.kind.clone(),
            reconciler: self.reconciler,
            rt: rt.clone(),
            config: self.config.clone(),
            gc_retry: GcConfig::from_env().retry,
            cancel: cancel.clone(),
        });

        let mut sources = vec![(format!("rc_{}", self.kind), self.kind.clone(), Source::Owned)];
        for child in &self.owns {
            sources.push((format!("rc_{}_o_{}", self.kind, child), child.clone(), Source::Child(child.clone())));
        }
        for (durable, kind, source) in sources {
            let cfg = ConsumerConfig::new(ObjectKey::kind_pattern(&kind).to_string())
                .durable(durable.clone())
                .ack_wait(ack_wait)
                .deliver(DeliverPolicy::LastPerKey);
            let consumer = rt.objects.consumer(cfg).await?;
            debug!(kind = %self.kind, durable = %durable, "controller consumer ready");
            tracker.spawn(Arc::clone(&inner).consume(consumer, source, tracker.clone()));
        }
        info!(kind = %self.kind, owns = ?self.owns, "controller started");
        Ok(ControllerHandle { kind: self.kind, cancel, tracker, stop_timeout: self.config.stop_timeout })
    }
}

/// A running controller.
pub struct ControllerHandle {
    kind: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stop_timeout: Duration,
}

impl ControllerHandle {
    pub fn kind(&self) -> &str { &self.kind }

    /// Cancel every loop and wait up to the stop timeout for in-flight reconciles.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.tracker.close();
        match tokio::time::timeout(self.stop_timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!(kind = %self.kind, "controller stopped");
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!(
                "controller {} still busy after {:?}",
                self.kind, self.stop_timeout
            ))),
        }
    }
}

struct Inner {
    kind: String,
    reconciler: Arc<dyn Reconciler>,
    rt: Runtime,
    config: ControllerConfig,
    gc_retry: Duration,
    cancel: CancellationToken,
}

impl Inner {
    async fn consume(self: Arc<Self>, consumer: Consumer, source: Source, tracker: TaskTracker) {
        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => break,
                d = consumer.next() => d,
            };
            let this = Arc::clone(&self);
            let source = source.clone();
            tracker.spawn(async move { this.process(delivery, source).await });
        }
        debug!(kind = %self.kind, consumer = %consumer.name(), "controller loop stopped");
    }

    async fn process(&self, delivery: Delivery, source: Source) {
        let entry = delivery.entry();
        if entry.operation != Operation::Put {
            delivery.ack();
            return;
        }

        let key = match self.request_key(entry.key.as_str(), &entry.value, &source) {
            Ok(Some(k)) => k,
            Ok(None) => {
                delivery.ack();
                return;
            }
            Err(e) => {
                warn!(key = %entry.key, error = %e, "dropping undecodable notification");
                delivery.term();
                return;
            }
        };

        match self.rt.objects.get(&entry.key).await {
            Ok(current) if current.revision == delivery.sequence() => {}
            Ok(current) => {
                debug!(key = %entry.key, seen = delivery.sequence(), current = current.revision, "stale notification");
                delivery.ack();
                return;
            }
            Err(KvError::NotFound(_)) => {
                delivery.ack();
                return;
            }
            Err(e) => {
                warn!(key = %entry.key, error = %e, "freshness check failed");
                delivery.nak_with_delay(self.config.lock_retry);
                return;
            }
        }

        let lock = match self.rt.mutex.lock(&key.to_string()).await {
            Ok(l) => l,
            Err(Error::Locked(_)) => {
                debug!(key = %key, "object busy; retrying later");
                delivery.nak_with_delay(self.config.lock_retry);
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "lock failed");
                delivery.nak_with_delay(self.config.lock_retry);
                return;
            }
        };

        let owner_triggered = matches!(source, Source::Child(_));
        let started = Instant::now();
        let res = self.run(&key, &delivery, &lock).await;
        counter!("reconcile_total", 1u64);
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

        match res {
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                let delay = backoff(self.config.backoff_base, delivery.num_delivered(), self.config.backoff_cap);
                warn!(key = %key, attempt = delivery.num_delivered(), retry_ms = %delay.as_millis(), error = %e, "reconcile failed");
                delivery.nak_with_delay(delay);
            }
            Ok(Outcome::Done) => {
                if !owner_triggered {
                    self.terminal_delete(&key).await;
                }
                delivery.ack();
            }
            Ok(Outcome::Requeue) => delivery.nak(),
            Ok(Outcome::RequeueAfter(d)) => delivery.nak_with_delay(d),
        }
        if let Err(e) = lock.release().await {
            warn!(key = %key, error = %e, "lock release failed");
        }
        debug!(key = %key, owner_triggered, took_ms = %started.elapsed().as_millis(), "reconcile pass done");
    }

    /// The object to reconcile for a notification, if any.
    fn request_key(&self, raw_key: &str, value: &[u8], source: &Source) -> Result<Option<ObjectKey>> {
        match source {
            Source::Owned => Ok(Some(raw_key.parse()?)),
            Source::Child(child_kind) => {
                let v: Json = serde_json::from_slice(value)?;
                let meta = MetaOnly::from_json(&v)?;
                let mut owners = meta.metadata.owner_references.iter().filter(|r| r.kind == self.kind);
                let owner = owners.next().map(|r| r.key());
                if owners.next().is_some() {
                    debug!(key = raw_key, child = %child_kind, "several owners of this kind; using the first");
                }
                Ok(owner)
            }
        }
    }

    /// Run the reconciler on its own task with a hard timeout, heartbeating lock and delivery.
    async fn run(&self, key: &ObjectKey, delivery: &Delivery, lock: &Lock) -> Result<Outcome> {
        let cancel = self.cancel.child_token();
        let reconciler = Arc::clone(&self.reconciler);
        let req = Request::new(key.clone());
        let mut task = tokio::spawn({
            let cancel = cancel.clone();
            async move { reconciler.reconcile(cancel, req).await }
        });

        let mut heartbeat = tokio::time::interval(self.rt.mutex.ttl() / 2);
        heartbeat.tick().await;
        let deadline = tokio::time::sleep(self.config.reconcile_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(res) => res,
                        Err(e) if e.is_panic() => {
                            let msg = panic_message(e.into_panic());
                            warn!(key = %key, panic = %msg, "reconciler panicked");
                            Err(Error::Panic(msg))
                        }
                        Err(e) => Err(Error::Internal(format!("reconcile task: {}", e))),
                    };
                }
                _ = &mut deadline => {
                    cancel.cancel();
                    task.abort();
                    return Err(Error::Timeout(format!(
                        "reconcile of {} exceeded {:?}",
                        key, self.config.reconcile_timeout
                    )));
                }
                _ = heartbeat.tick() => {
                    delivery.in_progress();
                    if let Err(e) = lock.in_progress().await {
                        warn!(key = %key, error = %e, "lock heartbeat failed");
                    }
                }
            }
        }
    }

    /// Collect an object marked for deletion once its reconciler is done with it.
    async fn terminal_delete(&self, key: &ObjectKey) {
        let obj = match ignore_not_found(self.rt.store.get(key).await) {
            Ok(Some(o)) => o,
            Ok(None) => return,
            Err(e) => {
                warn!(key = %key, error = %e, "reading object after reconcile failed");
                return;
            }
        };
        let marked = MetaOnly::from_json(&obj).map(|m| m.metadata.is_marked_for_deletion()).unwrap_or(false);
        if !marked {
            return;
        }
        match collect(&self.rt.store, key, self.gc_retry).await {
            Ok(Collection::Purged) => info!(key = %key, "object collected after final reconcile"),
            Ok(other) => debug!(key = %key, state = ?other, "object not collectible yet"),
            Err(e) => warn!(key = %key, error = %e, "terminal delete failed"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "reconciler panicked".to_string()
    }
}
