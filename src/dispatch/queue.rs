//! Per-provider admission queues.
//!
//! Each provider admits at most `capacity` upstream calls at once. Calls
//! beyond that wait in a heap ordered by priority rank, then arrival. An
//! [`Admission`] is a guard: dropping it frees the slot and admits the next
//! waiter directly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::types::PriorityClass;

struct Ticket {
    rank: u8,
    seq: u64,
    tx: oneshot::Sender<Admission>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct ProviderQueue {
    capacity: usize,
    in_flight: usize,
    waiting: BinaryHeap<Ticket>,
}

impl ProviderQueue {
    fn pop_live(&mut self) -> Option<Ticket> {
        while let Some(ticket) = self.waiting.pop() {
            if !ticket.tx.is_closed() {
                return Some(ticket);
            }
        }
        None
    }
}

/// Permission to run one upstream call against a provider.
pub(crate) struct Admission {
    queues: Arc<WorkQueues>,
    provider: String,
}

impl Admission {
    pub(crate) fn provider(&self) -> &str {
        &self.provider
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.queues.release(&self.provider);
    }
}

pub(crate) enum Admit {
    Now(Admission),
    Queued(oneshot::Receiver<Admission>),
}

pub(crate) struct WorkQueues {
    queues: Mutex<HashMap<String, ProviderQueue>>,
    /// Lowest rank the heap distinguishes; lower ranks are folded into it.
    floor: u8,
    next_seq: AtomicU64,
}

impl WorkQueues {
    /// `levels` is the number of priority classes kept distinct, from the top.
    pub(crate) fn new(levels: usize) -> Arc<Self> {
        let levels = levels.clamp(1, 4) as u8;
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            floor: 4 - levels,
            next_seq: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProviderQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rank(&self, priority: PriorityClass) -> u8 {
        let rank = match priority {
            PriorityClass::Low => 0,
            PriorityClass::Normal => 1,
            PriorityClass::High => 2,
            PriorityClass::Ultra => 3,
        };
        rank.max(self.floor)
    }

    /// Admit immediately if the provider has room, otherwise enqueue.
    pub(crate) fn admit(
        self: &Arc<Self>,
        provider: &str,
        capacity: usize,
        priority: PriorityClass,
    ) -> Admit {
        let rank = self.rank(priority);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.lock();
        let queue = queues.entry(provider.to_owned()).or_default();
        queue.capacity = capacity.max(1);
        queue.waiting.retain(|t| !t.tx.is_closed());
        if queue.in_flight < queue.capacity && queue.waiting.is_empty() {
            queue.in_flight += 1;
            return Admit::Now(Admission {
                queues: Arc::clone(self),
                provider: provider.to_owned(),
            });
        }
        let (tx, rx) = oneshot::channel();
        queue.waiting.push(Ticket { rank, seq, tx });
        Admit::Queued(rx)
    }

    fn release(self: &Arc<Self>, provider: &str) {
        {
            let mut queues = self.lock();
            if let Some(queue) = queues.get_mut(provider) {
                queue.in_flight = queue.in_flight.saturating_sub(1);
            }
        }
        self.admit_next(provider);
    }

    /// Hand one free slot to the best waiter. Returns whether one was sent.
    fn admit_next(self: &Arc<Self>, provider: &str) -> bool {
        let ticket = {
            let mut queues = self.lock();
            let Some(queue) = queues.get_mut(provider) else {
                return false;
            };
            if queue.in_flight >= queue.capacity {
                return false;
            }
            match queue.pop_live() {
                Some(ticket) => {
                    queue.in_flight += 1;
                    ticket
                }
                None => return false,
            }
        };
        let admission = Admission {
            queues: Arc::clone(self),
            provider: provider.to_owned(),
        };
        // A refused admission drops here and re-offers the slot.
        ticket.tx.send(admission).is_ok()
    }

    /// Admit waiters wherever capacity is free. Returns the number admitted.
    pub(crate) fn drain(self: &Arc<Self>) -> usize {
        let providers: Vec<String> = self.lock().keys().cloned().collect();
        let mut admitted = 0;
        for provider in providers {
            while self.admit_next(&provider) {
                admitted += 1;
            }
        }
        admitted
    }

    /// Waiting calls per provider.
    pub(crate) fn depths(&self) -> BTreeMap<String, usize> {
        self.lock()
            .iter()
            .map(|(name, q)| {
                let live = q.waiting.iter().filter(|t| !t.tx.is_closed()).count();
                (name.clone(), live)
            })
            .collect()
    }

    /// Calls currently admitted per provider.
    pub(crate) fn in_flight(&self) -> BTreeMap<String, usize> {
        self.lock()
            .iter()
            .map(|(name, q)| (name.clone(), q.in_flight))
            .collect()
    }
}
