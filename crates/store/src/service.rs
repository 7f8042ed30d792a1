//! Bus front-end for the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_bus::{respond_error, respond_json, Bus, Message, Subscription};
use keel_core::subject::{self, HEADER_FORCE, HEADER_GRACE, HEADER_MANAGER};
use keel_core::{Error, ObjectKey, Result};
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::Store;

/// Store replicas share this queue group, so each command is handled once.
pub const STORE_QUEUE: &str = "store";

/// Answers `keel.store.<command>.<kind>.<account>.<name>` requests.
#[derive(Clone)]
pub struct StoreService {
    store: Store,
    bus: Arc<dyn Bus>,
}

impl StoreService {
    pub fn new(store: Store, bus: Arc<dyn Bus>) -> Self {
        Self { store, bus }
    }

    /// Subscribe, then handle commands on a background task until `cancel` fires.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let sub = self.bus.queue_subscribe(subject::STORE_ALL, STORE_QUEUE).await?;
        info!(subject = subject::STORE_ALL, queue = STORE_QUEUE, "store: serving");
        Ok(tokio::spawn(self.run(sub, cancel)))
    }

    /// Serve until `cancel` fires and in-flight commands are answered.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        self.start(cancel).await?.await.map_err(|e| Error::Internal(format!("store service task: {}", e)))
    }

    async fn run(self, mut sub: Subscription, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                m = sub.next() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            let svc = self.clone();
            tracker.spawn(async move {
                let started = Instant::now();
                match svc.handle(&msg).await {
                    Ok(body) => respond_json(svc.bus.as_ref(), &msg, &body).await,
                    Err(e) => {
                        debug!(subject = %msg.subject, error = %e, "store: command failed");
                        respond_error(svc.bus.as_ref(), &msg, &e).await
                    }
                }
                debug!(subject = %msg.subject, took_ms = %started.elapsed().as_millis(), "store: command done");
            });
        }
        tracker.close();
        tracker.wait().await;
        info!("store: service stopped");
    }

    async fn handle(&self, msg: &Message) -> Result<Json> {
        let (command, key) = parse_subject(&msg.subject)?;
        match command {
            "get" => self.store.get(&key).await,
            "list" => Ok(Json::Array(self.store.list(&key).await?)),
            "create" => self.store.create(&key, body(msg)?).await,
            "apply" => {
                let manager = msg
                    .header(HEADER_MANAGER)
                    .ok_or_else(|| Error::BadRequest(format!("missing {} header", HEADER_MANAGER)))?;
                let force = msg.header(HEADER_FORCE).is_some_and(|v| v.eq_ignore_ascii_case("true"));
                self.store.apply(&key, body(msg)?, manager, force).await
            }
            "delete" => {
                let grace = match msg.header(HEADER_GRACE) {
                    Some(v) => v
                        .parse::<f64>()
                        .ok()
                        .filter(|s| s.is_finite() && *s >= 0.0)
                        .map(Duration::from_secs_f64)
                        .ok_or_else(|| Error::BadRequest(format!("invalid {} header {:?}", HEADER_GRACE, v)))?,
                    None => Duration::ZERO,
                };
                self.store.delete(&key, grace).await.map(|_| Json::Null)
            }
            "purge" => self.store.purge(&key).await.map(|_| Json::Null),
            other => {
                warn!(subject = %msg.subject, "unknown store command");
                Err(Error::BadRequest(format!("unknown store command {:?}", other)))
            }
        }
    }
}

/// Split `keel.store.<command>.<kind>.<account>.<name>`; `*` parts stay wildcards.
fn parse_subject(s: &str) -> Result<(&str, ObjectKey)> {
    match subject::tail(s, 2).as_slice() {
        [command, kind, account, name] => {
            let part = |p: &str| if p == keel_core::WILDCARD { String::new() } else { p.to_string() };
            Ok((*command, ObjectKey::new(part(*kind), part(*account), part(*name))))
        }
        _ => Err(Error::BadRequest(format!("malformed store subject {}", s))),
    }
}

fn body(msg: &Message) -> Result<Json> {
    Ok(serde_json::from_slice(&msg.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_parsing() {
        let (cmd, key) = parse_subject("keel.store.apply.widget.t.a").unwrap();
        assert_eq!((cmd, key), ("apply", ObjectKey::new("widget", "t", "a")));
        let (cmd, key) = parse_subject("keel.store.list.widget.*.*").unwrap();
        assert_eq!(cmd, "list");
        assert_eq!(key, ObjectKey::kind_pattern("widget"));
        assert!(parse_subject("keel.store.get.widget").is_err());
    }
}
