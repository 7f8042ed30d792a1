//! Ack/nak consumers with ack-wait redelivery.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use metrics::counter;
use tokio::sync::Notify;
use tracing::trace;

use crate::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    InFlight(u64),
    Delayed(u64),
}

#[derive(Debug)]
struct Pending {
    entry: Entry,
    delivered: u64,
    phase: Phase,
}

#[derive(Debug, Default)]
struct State {
    outstanding: BTreeMap<u64, Pending>,
    ready: VecDeque<u64>,
    next_gen: u64,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_gen += 1;
        self.next_gen
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    name: String,
    pub(crate) filter: String,
    ack_wait: Duration,
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    pub(crate) fn new(name: String, filter: String, ack_wait: Duration) -> Arc<Self> {
        Arc::new(Self { name, filter, ack_wait, state: Mutex::new(State::default()), notify: Notify::new() })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn enqueue(&self, entry: Entry) {
        let seq = entry.revision;
        {
            let mut st = self.lock();
            st.outstanding.insert(seq, Pending { entry, delivered: 0, phase: Phase::Ready });
            st.ready.push_back(seq);
        }
        self.notify.notify_one();
    }

    fn take(self: &Arc<Self>) -> Option<Delivery> {
        let (delivery, more) = {
            let mut st = self.lock();
            let mut found = None;
            while let Some(seq) = st.ready.pop_front() {
                let gen = st.bump();
                if let Some(p) = st.outstanding.get_mut(&seq) {
                    if p.phase != Phase::Ready {
                        continue;
                    }
                    p.delivered += 1;
                    p.phase = Phase::InFlight(gen);
                    found = Some(Delivery {
                        shared: Arc::clone(self),
                        entry: p.entry.clone(),
                        seq,
                        num_delivered: p.delivered,
                        gen: AtomicU64::new(gen),
                    });
                    break;
                }
            }
            (found, !st.ready.is_empty())
        };
        if more {
            self.notify.notify_one();
        }
        let d = delivery?;
        self.arm_ack_timer(d.seq, d.gen.load(Ordering::SeqCst));
        Some(d)
    }

    fn arm_ack_timer(self: &Arc<Self>, seq: u64, gen: u64) {
        let weak = Arc::downgrade(self);
        let wait = self.ack_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(seq, gen);
            }
        });
    }

    fn expire(&self, seq: u64, gen: u64) {
        let requeued = {
            let mut st = self.lock();
            match st.outstanding.get_mut(&seq) {
                Some(p) if p.phase == Phase::InFlight(gen) => {
                    p.phase = Phase::Ready;
                    st.ready.push_back(seq);
                    true
                }
                _ => false,
            }
        };
        if requeued {
            trace!(consumer = %self.name, seq, "ack wait expired; redelivering");
            counter!("kv_redelivered_total", 1u64);
            self.notify.notify_one();
        }
    }

    fn release_delayed(&self, seq: u64, gen: u64) {
        let requeued = {
            let mut st = self.lock();
            match st.outstanding.get_mut(&seq) {
                Some(p) if p.phase == Phase::Delayed(gen) => {
                    p.phase = Phase::Ready;
                    st.ready.push_back(seq);
                    true
                }
                _ => false,
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    fn settle(&self, seq: u64, gen: u64) -> bool {
        let mut st = self.lock();
        match st.outstanding.get(&seq) {
            Some(p) if p.phase == Phase::InFlight(gen) => {
                st.outstanding.remove(&seq);
                true
            }
            _ => false,
        }
    }

    fn nak(self: &Arc<Self>, seq: u64, gen: u64, delay: Duration) {
        let delayed_gen = {
            let mut st = self.lock();
            let next = st.bump();
            let Some(p) = st.outstanding.get_mut(&seq) else { return };
            if p.phase != Phase::InFlight(gen) {
                return;
            }
            if delay.is_zero() {
                p.phase = Phase::Ready;
                st.ready.push_back(seq);
                None
            } else {
                p.phase = Phase::Delayed(next);
                Some(next)
            }
        };
        match delayed_gen {
            None => self.notify.notify_one(),
            Some(g) => {
                let weak: Weak<Shared> = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.release_delayed(seq, g);
                    }
                });
            }
        }
    }

    fn touch(self: &Arc<Self>, seq: u64, gen: u64) -> Option<u64> {
        let next = {
            let mut st = self.lock();
            let next = st.bump();
            let p = st.outstanding.get_mut(&seq)?;
            if p.phase != Phase::InFlight(gen) {
                return None;
            }
            p.phase = Phase::InFlight(next);
            next
        };
        self.arm_ack_timer(seq, next);
        Some(next)
    }

    fn backlog_cleared(&self, through: u64) -> bool {
        self.lock().outstanding.range(..=through).next().is_none()
    }

    fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }
}

/// Handle onto a consumer queue. Clones share the queue.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub(crate) shared: Arc<Shared>,
    pub(crate) seeded_through: u64,
}

impl Consumer {
    pub fn name(&self) -> &str { &self.shared.name }

    /// Highest revision that was already stored when this handle attached (0 when none).
    pub fn seeded_through(&self) -> u64 { self.seeded_through }

    /// True once nothing at or below `through` is queued, in flight or delayed.
    pub fn backlog_cleared(&self, through: u64) -> bool { self.shared.backlog_cleared(through) }

    /// Entries not yet acknowledged.
    pub fn outstanding(&self) -> usize { self.shared.outstanding() }

    pub fn try_next(&self) -> Option<Delivery> { self.shared.take() }

    /// Wait for the next delivery.
    pub async fn next(&self) -> Delivery {
        loop {
            if let Some(d) = self.shared.take() {
                return d;
            }
            self.shared.notify.notified().await;
        }
    }
}

/// One delivery attempt of an entry. Settle it with exactly one of ack, nak or term.
#[derive(Debug)]
pub struct Delivery {
    shared: Arc<Shared>,
    entry: Entry,
    seq: u64,
    num_delivered: u64,
    gen: AtomicU64,
}

impl Delivery {
    pub fn entry(&self) -> &Entry { &self.entry }

    /// Stream sequence of this message; equal to the entry revision.
    pub fn sequence(&self) -> u64 { self.seq }

    /// 1 on first delivery.
    pub fn num_delivered(&self) -> u64 { self.num_delivered }

    pub fn ack(&self) {
        self.shared.settle(self.seq, self.gen.load(Ordering::SeqCst));
    }

    /// Drop the entry without redelivery.
    pub fn term(&self) {
        self.shared.settle(self.seq, self.gen.load(Ordering::SeqCst));
    }

    pub fn nak(&self) {
        self.nak_with_delay(Duration::ZERO);
    }

    pub fn nak_with_delay(&self, delay: Duration) {
        self.shared.nak(self.seq, self.gen.load(Ordering::SeqCst), delay);
    }

    /// Restart the ack-wait clock.
    pub fn in_progress(&self) {
        let gen = self.gen.load(Ordering::SeqCst);
        if let Some(next) = self.shared.touch(self.seq, gen) {
            self.gen.store(next, Ordering::SeqCst);
        }
    }
}
