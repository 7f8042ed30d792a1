use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_bus::{respond_error, Bus, BusError, Message, Subscription};
use keel_core::{subject, Error, ObjectKey, Result};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{AdvertiseReply, AdvertiseRequest, BrokerConfig, RunRequest};

/// Broker replicas share this queue group.
pub const BROKER_QUEUE: &str = "broker";

const NO_ACTOR: &str = "no actor available";

#[derive(Clone)]
pub struct Broker {
    bus: Arc<dyn Bus>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus, config: BrokerConfig::from_env() }
    }

    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Find an actor for `action` on `key` and run `payload` (an encoded [`RunRequest`]) on it.
    /// The actor gets whatever budget the advertise phase left. Returns its reply untouched.
    pub async fn invoke(&self, key: &ObjectKey, action: &str, payload: Vec<u8>) -> Result<Message> {
        let started = Instant::now();
        let req: RunRequest = serde_json::from_slice(&payload)?;
        let budget = match req.timeout_ms {
            0 => self.config.default_timeout,
            ms => Duration::from_millis(ms),
        };

        let actor = self.advertise(key, action, &req, budget).await?;
        histogram!("broker_advertise_ms", started.elapsed().as_secs_f64() * 1000.0);
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!("{} {}: budget spent finding an actor", key, action)));
        }
        debug!(key = %key, action, actor = %actor, remaining_ms = %remaining.as_millis(), "broker: running");

        let body = RunRequest { timeout_ms: (remaining.as_millis() as u64).max(1), ..req };
        let body = serde_json::to_vec(&body).map_err(|e| Error::Internal(format!("encoding run request: {}", e)))?;
        let run = Message::new(subject::run(key, action, &actor), body);
        let reply = match self.bus.request(run, remaining).await {
            Ok(r) => r,
            Err(BusError::NoResponders(_)) => {
                counter!("broker_no_actor_total", 1u64);
                return Err(Error::NoResponders(format!("actor {} is gone", actor)));
            }
            Err(BusError::Timeout(_)) => {
                return Err(Error::Timeout(format!("actor {} did not answer within {:?}", actor, remaining)));
            }
            Err(e) => return Err(e.into()),
        };
        counter!("broker_run_total", 1u64);
        info!(key = %key, action, actor = %actor, took_ms = %started.elapsed().as_millis(), "broker: run ok");
        Ok(reply)
    }

    /// First actor whose labels match the selector, within the advertise window.
    async fn advertise(&self, key: &ObjectKey, action: &str, req: &RunRequest, budget: Duration) -> Result<String> {
        let body = serde_json::to_vec(&AdvertiseRequest { label_selector: req.label_selector.clone() })
            .map_err(|e| Error::Internal(format!("encoding advertise request: {}", e)))?;
        let inbox = self.bus.new_inbox();
        let mut replies = self.bus.subscribe(&inbox).await?;
        self.bus.publish(Message::new(subject::advertise(key, action), body).with_reply(inbox)).await?;

        let window = self.config.advertise_timeout.min(budget);
        match tokio::time::timeout(window, replies.next()).await {
            Ok(Some(reply)) if !reply.is_no_responders() => {
                let r: AdvertiseReply = serde_json::from_slice(&reply.payload)
                    .map_err(|e| Error::Internal(format!("bad advertise reply: {}", e)))?;
                Ok(r.id)
            }
            _ => {
                counter!("broker_no_actor_total", 1u64);
                debug!(key = %key, action, window_ms = %window.as_millis(), "broker: nobody answered");
                Err(Error::NoResponders(NO_ACTOR.into()))
            }
        }
    }

    /// Subscribe to `keel.broker.>` and answer requests on a background task.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let sub = self.bus.queue_subscribe(subject::BROKER_ALL, BROKER_QUEUE).await?;
        info!(subject = subject::BROKER_ALL, queue = BROKER_QUEUE, "broker: serving");
        Ok(tokio::spawn(self.run(sub, cancel)))
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
            let broker = self.clone();
            tracker.spawn(async move { broker.handle(msg).await });
        }
        tracker.close();
        tracker.wait().await;
        info!("broker: stopped");
    }

    async fn handle(&self, msg: Message) {
        let res = match parse_subject(&msg.subject) {
            Ok((key, action)) => self.invoke(&key, &action, msg.payload.clone()).await,
            Err(e) => Err(e),
        };
        match res {
            Ok(reply) => {
                let Some(to) = msg.reply.clone() else { return };
                let relay = Message { subject: to, reply: None, headers: reply.headers, payload: reply.payload };
                if let Err(e) = self.bus.publish(relay).await {
                    warn!(subject = %msg.subject, error = %e, "broker: relaying reply failed");
                }
            }
            Err(e) => {
                debug!(subject = %msg.subject, error = %e, "broker: request failed");
                respond_error(self.bus.as_ref(), &msg, &e).await;
            }
        }
    }
}

/// Split `keel.broker.<kind>.<account>.<name>.<action>`.
fn parse_subject(s: &str) -> Result<(ObjectKey, String)> {
    match subject::tail(s, 2).as_slice() {
        [kind, account, name, action] => {
            let key = ObjectKey::new(*kind, *account, *name);
            key.validate()?;
            Ok((key, action.to_string()))
        }
        _ => Err(Error::BadRequest(format!("malformed broker subject {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_parsing() {
        let (key, action) = parse_subject("keel.broker.vm.t.web.restart").unwrap();
        assert_eq!(key, ObjectKey::new("vm", "t", "web"));
        assert_eq!(action, "restart");
        assert!(parse_subject("keel.broker.vm.t.web").is_err());
        assert!(parse_subject("keel.broker.vm.*.web.restart").is_err());
    }
}
