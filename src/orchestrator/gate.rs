use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Concurrency limiter that admits waiters by priority
///
/// Once every slot is taken, callers queue; a freed slot goes to the highest
/// priority waiter, FIFO among equal priorities. The slot travels through a
/// oneshot channel so no other caller can grab it in between.
#[derive(Debug)]
pub struct PriorityGate {
    capacity: usize,
    state: Mutex<GateState>,
}

#[derive(Debug)]
struct GateState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

#[derive(Debug)]
struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<GatePermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One occupied slot; dropping it hands the slot on
#[derive(Debug)]
pub struct GatePermit {
    gate: Option<Arc<PriorityGate>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl PriorityGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            state: Mutex::new(GateState {
                available: capacity,
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Callers currently queued
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Waits for a slot
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> GatePermit {
        loop {
            let rx = {
                let mut state = self.state.lock();
                if state.available > 0 && state.waiters.is_empty() {
                    state.available -= 1;
                    return GatePermit {
                        gate: Some(Arc::clone(self)),
                    };
                }
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiters.push(Waiter { priority, seq, tx });
                rx
            };
            // a dropped sender only happens if the waiter was discarded
            // without a slot, so queue again
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    fn release(self: Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match state.waiters.pop() {
                    Some(waiter) => waiter,
                    None => {
                        state.available = (state.available + 1).min(self.capacity);
                        return;
                    }
                }
            };
            let permit = GatePermit {
                gate: Some(Arc::clone(&self)),
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                // waiter gave up; defuse the permit and try the next one
                Err(mut permit) => {
                    permit.gate = None;
                }
            }
        }
    }
}
