//! Keel message bus: subject-addressed publish/subscribe, queue groups and request/reply.

#![forbid(unsafe_code)]

mod memory;
mod reply;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use keel_core::subject::HEADER_STATUS;
use tokio::sync::mpsc;

pub use memory::MemoryBus;
pub use reply::{decode_reply, respond, respond_error, respond_json, respond_result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { subject: subject.into(), payload, ..Default::default() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn status(&self) -> Option<u16> {
        self.header(HEADER_STATUS).and_then(|s| s.parse().ok())
    }

    /// Status-only reply the bus sends when a request reached nobody.
    pub fn is_no_responders(&self) -> bool {
        self.status() == Some(503) && self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no responders on {0}")]
    NoResponders(String),
    #[error("request on {0} timed out")]
    Timeout(String),
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
}

impl From<BusError> for keel_core::Error {
    fn from(e: BusError) -> Self {
        use keel_core::Error;
        match e {
            BusError::NoResponders(s) => Error::NoResponders(s),
            BusError::Timeout(s) => Error::Timeout(s),
            BusError::InvalidSubject(s) => Error::BadRequest(format!("invalid subject {}", s)),
        }
    }
}

/// Inbound messages for one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn subject(&self) -> &str { &self.subject }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, msg: Message) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Each message goes to exactly one member of `queue`.
    async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscription, BusError>;

    fn new_inbox(&self) -> String;

    /// Publish with a fresh inbox and wait for the first reply.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, BusError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox).await?;
        let subject = msg.subject.clone();
        self.publish(msg.with_reply(inbox)).await?;
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(reply)) if reply.is_no_responders() => Err(BusError::NoResponders(subject)),
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => Err(BusError::Timeout(subject)),
        }
    }
}

#[async_trait]
impl<T: Bus + ?Sized> Bus for std::sync::Arc<T> {
    async fn publish(&self, msg: Message) -> Result<(), BusError> { (**self).publish(msg).await }
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> { (**self).subscribe(subject).await }
    async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscription, BusError> {
        (**self).queue_subscribe(subject, queue).await
    }
    fn new_inbox(&self) -> String { (**self).new_inbox() }
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, BusError> {
        (**self).request(msg, timeout).await
    }
}
