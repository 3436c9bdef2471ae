//! Time-ordered queues driven by a single timer
//!
//! [`TtlHeap`] is a min-heap ordered by deadline with exactly one [`Sleep`] which is reset to the
//! earliest deadline on every mutation. Churn of scheduled items therefore never spawns timers.
//! [`BackoffHeap`] builds exponential backoff on top of it and is used for scheduling reconnects.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep_until, Instant, Sleep};

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // reversed: `BinaryHeap` is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of items ordered by deadline
///
/// Items with equal deadlines are ordered by insertion.
pub struct TtlHeap<T> {
    heap: BinaryHeap<Entry<T>>,
    // created on first wait, so the heap can be constructed outside of runtime
    timer: Option<Pin<Box<Sleep>>>,
    next_seq: u64,
}

impl<T> TtlHeap<T> {
    /// Constructs an empty heap
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timer: None,
            next_seq: 0,
        }
    }

    /// Schedules `item` at `deadline`
    pub fn enqueue(&mut self, item: T, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            item,
        });
        self.reset_timer();
    }

    /// Removes the earliest item, whether its deadline passed or not
    pub fn dequeue(&mut self) -> Option<T> {
        let entry = self.heap.pop()?;
        self.reset_timer();
        Some(entry.item)
    }

    /// Removes all items whose deadline is at or before `now`
    pub fn dequeue_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired = vec![];
        while self.heap.peek().map(|e| e.deadline <= now).unwrap_or(false) {
            if let Some(entry) = self.heap.pop() {
                expired.push(entry.item)
            }
        }
        if !expired.is_empty() {
            self.reset_timer();
        }
        expired
    }

    /// Earliest deadline
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Earliest item
    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.item)
    }

    /// Amount of scheduled items
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Waits until the earliest deadline
    ///
    /// Never resolves while heap is empty. Cancel safe: can be used in `tokio::select!`.
    pub async fn wait_on_timer(&mut self) {
        let Some(deadline) = self.peek_deadline() else {
            return std::future::pending().await;
        };
        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(sleep_until(deadline)));
        if timer.deadline() != deadline {
            timer.as_mut().reset(deadline);
        }
        timer.as_mut().await
    }

    /// Waits until at least one item expires and removes all expired items
    ///
    /// Cancel safe.
    pub async fn expired(&mut self) -> Vec<T> {
        loop {
            self.wait_on_timer().await;
            let expired = self.dequeue_expired(Instant::now());
            if !expired.is_empty() {
                return expired;
            }
        }
    }

    fn reset_timer(&mut self) {
        let Some(deadline) = self.peek_deadline() else {
            return;
        };
        if let Some(timer) = self.timer.as_mut() {
            timer.as_mut().reset(deadline);
        }
    }
}

impl<T> Default for TtlHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Schedules keys with exponential backoff
///
/// Every time a key is enqueued, it's delayed by `min(base·2^attempt, max)` and its attempt
/// counter is incremented. A key which is already queued is not enqueued twice.
pub struct BackoffHeap<K> {
    heap: TtlHeap<K>,
    queued: HashSet<K>,
    attempts: HashMap<K, u32>,
    base: Duration,
    max: Duration,
}

impl<K: Hash + Eq + Clone> BackoffHeap<K> {
    /// Constructs an empty heap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            heap: TtlHeap::new(),
            queued: HashSet::new(),
            attempts: HashMap::new(),
            base,
            max,
        }
    }

    /// Schedules `key`
    ///
    /// Returns the delay, or `None` if key is already scheduled.
    pub fn enqueue(&mut self, key: K) -> Option<Duration> {
        if self.queued.contains(&key) {
            return None;
        }
        let attempt = self.attempts.entry(key.clone()).or_insert(0);
        let delay = backoff(self.base, self.max, *attempt);
        *attempt = attempt.saturating_add(1);

        self.queued.insert(key.clone());
        self.heap.enqueue(key, Instant::now() + delay);
        Some(delay)
    }

    /// Removes the earliest scheduled key, whether its deadline passed or not
    pub fn dequeue(&mut self) -> Option<K> {
        let key = self.heap.dequeue()?;
        self.queued.remove(&key);
        Some(key)
    }

    /// Waits until the earliest key is due, see [`TtlHeap::wait_on_timer`]
    pub async fn wait_on_timer(&mut self) {
        self.heap.wait_on_timer().await
    }

    /// Waits until the earliest key is due and removes it
    pub async fn next_due(&mut self) -> K {
        loop {
            self.heap.wait_on_timer().await;
            if let Some(key) = self.dequeue() {
                return key;
            }
        }
    }

    /// Forgets previous attempts of the key, next delay will be `base`
    pub fn reset_attempts(&mut self, key: &K) {
        self.attempts.remove(key);
    }

    /// Amount of scheduled keys
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map(|delay| delay.min(max))
        .unwrap_or(max)
}
