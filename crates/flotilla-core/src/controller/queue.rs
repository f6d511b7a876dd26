//! Work queue with the client-go guarantees: coalescing of pending work,
//! at most one in-flight handler per key, delayed enqueue and per-key
//! failure backoff.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::backoff::{Backoff, DEFAULT_BACKOFF};

pub trait QueueKey: Clone + Debug + Eq + Hash + Send + Sync + 'static {}
impl<K: Clone + Debug + Eq + Hash + Send + Sync + 'static> QueueKey for K {}

struct Delayed<K> {
    at: Instant,
    seq: u64,
    key: K,
}

// Min-heap by deadline; `seq` makes ordering total without requiring K: Ord.
impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl<K> Eq for Delayed<K> {}
impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, so BinaryHeap pops the earliest deadline first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys with pending work, queued or awaiting re-queue after processing.
    dirty: HashSet<K>,
    /// Keys currently held by a worker.
    processing: HashSet<K>,
    delayed: BinaryHeap<Delayed<K>>,
    failures: HashMap<K, u32>,
    next_seq: u64,
    shut_down: bool,
}

pub struct WorkQueue<K: QueueKey> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K: QueueKey> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BACKOFF)
    }

    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                failures: HashMap::new(),
                next_seq: 0,
                shut_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enqueues a key. Repeated adds while the key is pending coalesce into
    /// one invocation; adds while the key is processing re-run it afterwards.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shut_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Enqueues a key after `delay`. Bursts within the window collapse into
    /// a single invocation once due.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(Delayed {
            at: Instant::now() + delay,
            seq,
            key,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Waits for the next key. Returns `None` once the queue shuts down.
    pub async fn next(&self) -> Option<K> {
        loop {
            // Register interest before inspecting state, so an add() racing
            // with the lock release cannot be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }

                let now = Instant::now();
                while let Some(due) = state.delayed.peek() {
                    if due.at > now {
                        break;
                    }
                    let due = state.delayed.pop().expect("peeked entry exists");
                    if !state.dirty.contains(&due.key) {
                        state.dirty.insert(due.key.clone());
                        if !state.processing.contains(&due.key) {
                            state.queue.push_back(due.key);
                        }
                    }
                }

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }

                state.delayed.peek().map(|d| d.at)
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks a key as no longer processing; work added meanwhile is queued.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Records a failure and re-enqueues with exponential backoff. Returns
    /// the chosen delay.
    pub fn requeue_failure(&self, key: &K) -> Duration {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = self.backoff.delay(failures);
        self.add_after(key.clone(), delay);
        delay
    }

    /// Clears failure history after a success.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().queue.len()
    }
}
