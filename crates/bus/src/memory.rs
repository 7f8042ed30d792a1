use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use keel_core::subject::{self, HEADER_STATUS};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Bus, BusError, Message, Subscription};

struct Sub {
    pattern: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct State {
    subs: Vec<Sub>,
    /// Round-robin cursor per queue group.
    cursors: FxHashMap<String, usize>,
}

/// In-process bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, pattern: &str, queue: Option<&str>) -> Result<Subscription, BusError> {
        if pattern.is_empty() || pattern.split('.').any(|t| t.is_empty()) {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subs.push(Sub { pattern: pattern.to_string(), queue: queue.map(str::to_string), tx });
        Ok(Subscription { subject: pattern.to_string(), rx })
    }

    /// Deliver to every plain subscriber and one member per queue group. Returns the count.
    fn route(&self, msg: &Message) -> usize {
        let mut st = self.lock();
        st.subs.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        let mut groups: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (i, s) in st.subs.iter().enumerate() {
            if !subject::matches(&s.pattern, &msg.subject) {
                continue;
            }
            match &s.queue {
                Some(q) => groups.entry(format!("{}|{}", s.pattern, q)).or_default().push(i),
                None => {
                    if s.tx.send(msg.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        for (group, members) in groups {
            let cursor = st.cursors.entry(group).or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if st.subs[pick].tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        if msg.subject.is_empty() {
            return Err(BusError::InvalidSubject(msg.subject));
        }
        let delivered = self.route(&msg);
        trace!(subject = %msg.subject, delivered, "published");
        if delivered == 0 {
            if let Some(reply) = &msg.reply {
                let status = Message::new(reply.clone(), Vec::new()).with_header(HEADER_STATUS, "503");
                self.route(&status);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        self.add(subject, None)
    }

    async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscription, BusError> {
        self.add(subject, Some(queue))
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }
}
