//! Typed client for a remote store served over the bus.

use std::sync::Arc;
use std::time::Duration;

use keel_bus::{decode_reply, Bus, BusError, Message};
use keel_core::subject::{self, HEADER_FORCE, HEADER_GRACE, HEADER_MANAGER};
use keel_core::{env_or, Error, ObjectKey, Result};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

#[derive(Clone)]
pub struct Client {
    bus: Arc<dyn Bus>,
    timeout: Duration,
}

impl Client {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus, timeout: Duration::from_secs(env_or("KEEL_CLIENT_TIMEOUT_SECS", 10)) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Json> {
        self.call(Message::new(subject::store("get", key), Vec::new())).await
    }

    /// Fetch and decode into a typed object.
    pub async fn get_as<O: DeserializeOwned>(&self, key: &ObjectKey) -> Result<O> {
        let v = self.get(key).await?;
        serde_json::from_value(v).map_err(|e| Error::Internal(format!("decoding {}: {}", key, e)))
    }

    pub async fn list(&self, pattern: &ObjectKey) -> Result<Vec<Json>> {
        match self.call(Message::new(subject::store("list", pattern), Vec::new())).await? {
            Json::Array(items) => Ok(items),
            other => Err(Error::Internal(format!("list reply is not an array: {}", other))),
        }
    }

    pub async fn create(&self, key: &ObjectKey, obj: &Json) -> Result<Json> {
        self.call(Message::new(subject::store("create", key), encode(obj)?)).await
    }

    pub async fn apply(&self, key: &ObjectKey, obj: &Json, manager: &str, force: bool) -> Result<Json> {
        let msg = Message::new(subject::store("apply", key), encode(obj)?)
            .with_header(HEADER_MANAGER, manager)
            .with_header(HEADER_FORCE, force.to_string());
        self.call(msg).await
    }

    pub async fn delete(&self, key: &ObjectKey, grace: Duration) -> Result<()> {
        let msg = Message::new(subject::store("delete", key), Vec::new())
            .with_header(HEADER_GRACE, grace.as_secs_f64().to_string());
        self.call(msg).await.map(|_| ())
    }

    pub async fn purge(&self, key: &ObjectKey) -> Result<()> {
        self.call(Message::new(subject::store("purge", key), Vec::new())).await.map(|_| ())
    }

    async fn call(&self, msg: Message) -> Result<Json> {
        let reply = match self.bus.request(msg, self.timeout).await {
            Ok(r) => r,
            Err(BusError::NoResponders(s)) => return Err(Error::NoResponders(format!("no store serving {}", s))),
            Err(e) => return Err(e.into()),
        };
        let bytes = decode_reply(reply)?;
        if bytes.is_empty() {
            return Ok(Json::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| Error::Internal(format!("decoding store reply: {}", e)))
    }
}

fn encode(obj: &Json) -> Result<Vec<u8>> {
    serde_json::to_vec(obj).map_err(|e| Error::BadRequest(format!("encoding object: {}", e)))
}
