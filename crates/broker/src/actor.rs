//! Actors: workers that register actions for a kind and answer the broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_bus::{respond_error, respond_json, Bus, Message, Subscription};
use keel_core::{env_or, is_valid_token, Error, Object, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{AdvertiseReply, AdvertiseRequest, RunRequest};

/// Work an actor performs on an object.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken, input: Object) -> Result<Object>;
}

/// Labels every actor carries: `hostname`, `os` and `arch`.
pub fn common_labels() -> BTreeMap<String, String> {
    let hostname = env_or("HOSTNAME", "unknown".to_string());
    BTreeMap::from([
        ("hostname".to_string(), hostname),
        ("os".to_string(), std::env::consts::OS.to_string()),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
    ])
}

/// A worker identity plus the actions it serves.
pub struct Actor {
    id: String,
    labels: BTreeMap<String, String>,
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Actor {
    /// New actor with a random id. `labels` are added to the common ones.
    pub fn new(bus: Arc<dyn Bus>, labels: BTreeMap<String, String>) -> Self {
        let mut all = common_labels();
        all.extend(labels);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            labels: all,
            bus,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn labels(&self) -> &BTreeMap<String, String> { &self.labels }

    /// Serve `action` for every object of `kind`.
    pub async fn register(&self, kind: &str, action: &str, handler: Arc<dyn Action>) -> Result<()> {
        if !is_valid_token(kind) || !is_valid_token(action) {
            return Err(Error::BadRequest(format!("invalid actor registration {}/{}", kind, action)));
        }
        let advertise = format!("keel.actor.advertise.{}.*.*.{}", kind, action);
        let run = format!("keel.actor.run.{}.*.*.{}.{}", kind, action, self.id);
        let adv_sub = self.bus.subscribe(&advertise).await?;
        let run_sub = self.bus.subscribe(&run).await?;

        let id = self.id.clone();
        let labels = self.labels.clone();
        self.tracker.spawn(answer_advertise(Arc::clone(&self.bus), adv_sub, id, labels, self.cancel.clone()));
        self.tracker.spawn(serve_runs(Arc::clone(&self.bus), run_sub, handler, self.cancel.clone(), self.tracker.clone()));
        info!(actor = %self.id, kind, action, "actor registered");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn answer_advertise(
    bus: Arc<dyn Bus>,
    mut sub: Subscription,
    id: String,
    labels: BTreeMap<String, String>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = sub.next() => match m {
                Some(m) => m,
                None => break,
            },
        };
        let req: AdvertiseRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "ignoring malformed advertise request");
                continue;
            }
        };
        if req.label_selector.as_ref().map_or(true, |s| s.matches(&labels)) {
            respond_json(bus.as_ref(), &msg, &AdvertiseReply { id: id.clone() }).await;
        } else {
            debug!(actor = %id, "selector does not match; staying silent");
        }
    }
}

async fn serve_runs(
    bus: Arc<dyn Bus>,
    mut sub: Subscription,
    handler: Arc<dyn Action>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = sub.next() => match m {
                Some(m) => m,
                None => break,
            },
        };
        let bus = Arc::clone(&bus);
        let handler = Arc::clone(&handler);
        let cancel = cancel.child_token();
        tracker.spawn(async move {
            match run_one(handler.as_ref(), cancel, &msg).await {
                Ok(out) => respond_json(bus.as_ref(), &msg, &out).await,
                Err(e) => respond_error(bus.as_ref(), &msg, &e).await,
            }
        });
    }
}

async fn run_one(handler: &dyn Action, cancel: CancellationToken, msg: &Message) -> Result<Object> {
    let req: RunRequest = serde_json::from_slice(&msg.payload)?;
    let input: Object = serde_json::from_value(req.data)?;
    if req.timeout_ms == 0 {
        return handler.run(cancel, input).await;
    }
    let limit = Duration::from_millis(req.timeout_ms);
    match tokio::time::timeout(limit, handler.run(cancel.clone(), input)).await {
        Ok(res) => res,
        Err(_) => {
            cancel.cancel();
            Err(Error::Timeout(format!("action exceeded {:?}", limit)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_labels_cover_platform() {
        let l = common_labels();
        assert_eq!(l.get("os").map(String::as_str), Some(std::env::consts::OS));
        assert_eq!(l.get("arch").map(String::as_str), Some(std::env::consts::ARCH));
        assert!(l.contains_key("hostname"));
    }
}
