//! `TimerQueue`: an ordered set of deadline-keyed one-shot callbacks.
//!
//! Deadlines are `Instant`s (monotonic only — wall-clock changes must never affect
//! firing). Ties are broken by enqueue order, which a `BinaryHeap` alone would not guarantee, so
//! each entry carries a sequence number and orders on `(deadline, seq)`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

/// Opaque timer identity. Stays valid (as a no-op `cancel` target) even after the timer fires.
pub type TimerId = u64;

struct Entry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
    callback: Box<dyn FnOnce()>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap: we want the soonest deadline (and, for ties, the
        // lowest sequence number — the one enqueued first) to pop first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    cancelled: HashMap<TimerId, ()>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    /// Schedules `callback` to run at `now + delay`, returning an id usable with `cancel`.
    pub fn enqueue(&mut self, now: Instant, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.next_seq += 1;
        let seq = self.next_seq;
        let deadline = now + delay;
        self.heap.push(Entry {
            deadline,
            seq,
            id,
            callback,
        });
        trace!(id, ?delay, "timer enqueued");
        id
    }

    /// Marks `id` as cancelled. A no-op if `id` is unknown, already fired, or already cancelled.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id, ());
        trace!(id, "timer cancelled");
    }

    /// The earliest non-cancelled deadline still pending, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_cancelled_front();
        self.heap.peek().map(|e| e.deadline)
    }

    fn drop_cancelled_front(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.id).is_some() {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// Pops and invokes every non-cancelled entry whose deadline is `<= now`. Entries enqueued by
    /// a callback during this call are not fired in the same pass, even if their deadline has
    /// already passed — they become eligible on the next call.
    pub fn fire_expired(&mut self, now: Instant) {
        let ready_through_seq = self.next_seq;
        loop {
            self.drop_cancelled_front();
            match self.heap.peek() {
                Some(top) if top.deadline <= now && top.seq <= ready_through_seq => {
                    let entry = self.heap.pop().expect("peeked Some");
                    trace!(id = entry.id, "timer fired");
                    (entry.callback)();
                }
                _ => break,
            }
        }
    }
}
