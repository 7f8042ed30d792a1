use std::sync::Arc;
use std::time::Duration;

use keel_bus::{decode_reply, Bus, BusError, Message};
use keel_core::{subject, Error, LabelSelector, ObjectKey, Result};
use serde_json::Value as Json;

use crate::RunRequest;

/// Invokes actions through the broker.
#[derive(Clone)]
pub struct BrokerClient {
    bus: Arc<dyn Bus>,
    slack: Duration,
}

impl BrokerClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus, slack: Duration::from_millis(500) }
    }

    /// Run `action` on `key` and return the actor's output object.
    pub async fn run(
        &self,
        key: &ObjectKey,
        action: &str,
        data: Json,
        label_selector: Option<LabelSelector>,
        timeout: Duration,
    ) -> Result<Json> {
        key.validate()?;
        let req = RunRequest { timeout_ms: timeout.as_millis() as u64, data, label_selector };
        let body = serde_json::to_vec(&req).map_err(|e| Error::Internal(format!("encoding run request: {}", e)))?;
        let msg = Message::new(subject::broker(key, action), body);
        // The broker answers errors itself; wait a little past the budget for them.
        let reply = match self.bus.request(msg, timeout + self.slack).await {
            Ok(r) => r,
            Err(BusError::NoResponders(_)) => return Err(Error::NoResponders("no broker serving".into())),
            Err(e) => return Err(e.into()),
        };
        let bytes = decode_reply(reply)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
