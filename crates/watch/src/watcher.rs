use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{defaults, env_or, Error, Event, EventOperation, ObjectKey, Outcome, Result};
use keel_kv::{ConsumerConfig, Delivery, Entry, KeyValue, Operation};
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Callback invoked once per event. The outcome drives acknowledgement.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, cancel: CancellationToken, event: Event) -> Result<Outcome>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, event: Event) -> Result<Outcome> {
        (self.0)(cancel, event).await
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Keys to watch; an empty kind watches every kind.
    pub pattern: ObjectKey,
    /// Replicas sharing a durable name split the events between them.
    pub durable: Option<String>,
    pub ack_wait: Duration,
    /// Redelivery delay after a handler error.
    pub backoff: Duration,
}

impl WatcherConfig {
    pub fn new(kind: &str) -> Self {
        Self {
            pattern: ObjectKey::kind_pattern(kind),
            durable: None,
            ack_wait: Duration::from_secs(env_or("KEEL_WATCH_ACK_WAIT_SECS", defaults::WATCH_ACK_WAIT.as_secs())),
            backoff: Duration::from_millis(env_or("KEEL_WATCH_BACKOFF_MS", defaults::WATCH_BACKOFF.as_millis() as u64)),
        }
    }

    pub fn all_kinds() -> Self {
        Self::new("")
    }

    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable = Some(name.into());
        self
    }
}

/// Turn a raw KV entry into a semantic event.
///
/// Tombstones and purges become `Purge`. A put whose object carries a deletion timestamp is a
/// `Delete`. Put payloads get `metadata.revision` set from the entry.
pub fn classify(entry: &Entry) -> Result<Event> {
    let key: ObjectKey = entry.key.parse()?;
    if entry.operation != Operation::Put {
        return Ok(Event { operation: EventOperation::Purge, key, revision: entry.revision, data: Json::Null });
    }
    let mut data: Json = serde_json::from_slice(&entry.value)
        .map_err(|e| Error::Internal(format!("decoding {} at revision {}: {}", entry.key, entry.revision, e)))?;
    let marked = data.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null());
    if let Some(meta) = data.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("revision".into(), Json::from(entry.revision));
    }
    let operation = if marked { EventOperation::Delete } else { EventOperation::Put };
    Ok(Event { operation, key, revision: entry.revision, data })
}

/// Apply a handler outcome to a delivery.
pub fn settle(delivery: &Delivery, res: &Result<Outcome>, backoff: Duration) {
    match res {
        Ok(Outcome::Done) => delivery.ack(),
        Ok(Outcome::Requeue) => delivery.nak(),
        Ok(Outcome::RequeueAfter(d)) => delivery.nak_with_delay(*d),
        Err(_) => delivery.nak_with_delay(backoff),
    }
}

/// Run the handler, restarting the ack-wait clock every half period so a slow handler is
/// not redelivered while it still runs.
async fn handle_with_heartbeat(
    handler: &dyn EventHandler,
    cancel: CancellationToken,
    event: Event,
    delivery: &Delivery,
    ack_wait: Duration,
) -> Result<Outcome> {
    let fut = handler.handle(cancel, event);
    tokio::pin!(fut);
    let mut heartbeat = tokio::time::interval((ack_wait / 2).max(Duration::from_millis(1)));
    heartbeat.tick().await;
    loop {
        tokio::select! {
            res = &mut fut => return res,
            _ = heartbeat.tick() => delivery.in_progress(),
        }
    }
}

/// Running watch over a key pattern.
pub struct Watcher {
    init: watch::Receiver<bool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Watcher {
    pub async fn start(kv: Arc<dyn KeyValue>, config: WatcherConfig, handler: Arc<dyn EventHandler>) -> Result<Self> {
        Self::start_with_cancel(kv, config, handler, CancellationToken::new()).await
    }

    pub async fn start_with_cancel(
        kv: Arc<dyn KeyValue>,
        config: WatcherConfig,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.pattern.validate_pattern()?;
        let filter = config.pattern.to_string();
        let mut cc = ConsumerConfig::new(filter.clone()).ack_wait(config.ack_wait);
        if let Some(d) = &config.durable {
            cc = cc.durable(d.clone());
        }
        let consumer = kv.consumer(cc).await?;
        let target = consumer.seeded_through();
        let (init_tx, init_rx) = watch::channel(target == 0 || consumer.backlog_cleared(target));
        let init_tx = Arc::new(init_tx);
        let tracker = TaskTracker::new();
        info!(pattern = %filter, durable = ?config.durable, backlog_through = target, "watcher started");

        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        tracker.spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    d = consumer.next() => d,
                };
                let handler = Arc::clone(&handler);
                let consumer = consumer.clone();
                let init_tx = Arc::clone(&init_tx);
                let cancel = loop_cancel.child_token();
                let backoff = config.backoff;
                let ack_wait = config.ack_wait;
                loop_tracker.spawn(async move {
                    match classify(delivery.entry()) {
                        Ok(event) => {
                            let key = event.key.clone();
                            let op = event.operation;
                            let res = handle_with_heartbeat(handler.as_ref(), cancel, event, &delivery, ack_wait).await;
                            if let Err(e) = &res {
                                counter!("watch_handler_errors_total", 1u64);
                                warn!(key = %key, operation = ?op, error = %e, "watch handler failed; retrying");
                            }
                            settle(&delivery, &res, backoff);
                        }
                        Err(e) => {
                            warn!(key = %delivery.entry().key, error = %e, "dropping undecodable entry");
                            delivery.term();
                        }
                    }
                    if !*init_tx.borrow() && consumer.backlog_cleared(target) {
                        debug!(through = target, "watch backlog replayed");
                        let _ = init_tx.send(true);
                    }
                });
            }
            debug!("watch loop stopped");
        });
        tracker.close();
        Ok(Self { init: init_rx, cancel, tracker })
    }

    pub fn is_initialized(&self) -> bool {
        *self.init.borrow()
    }

    /// Resolve once every object that existed at start has been handled.
    pub async fn wait_until_init(&self) {
        let mut rx = self.init.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop receiving and wait for in-flight handlers.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}
