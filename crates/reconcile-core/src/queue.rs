//! Work queue
//!
//! Deduplicating FIFO of reconcile keys. A key is either absent, pending
//! (dirty and queued), in flight (processing), or in flight and dirty again.
//! That last state is released by `done`, which re-queues the key exactly once
//! no matter how many times it was added in the meantime. This gives at most
//! one in-flight reconcile per key without losing updates.

use crate::backoff::ItemBackoff;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ItemBackoff<K>,
}

/// Deduplicating, rate-limited work queue. Clones share the same queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Creates a queue whose rate limiter backs off from `base` up to `max`.
    #[must_use]
    pub fn new(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff: ItemBackoff::new(base_backoff, max_backoff),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `key` unless it is already pending. A key that is in flight is
    /// marked dirty and re-queued when it is done.
    pub fn add(&self, key: K) {
        {
            let mut state = self.state();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                trace!(?key, "Key in flight, deferring");
                return;
            }
            state.queue.push_back(key);
        }
        self.shared.notify.notify_one();
    }

    /// Enqueues `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueues `key` after its next rate-limiter delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.shared.backoff.next_delay(&key);
        trace!(?key, ?delay, "Rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Resets the rate limiter for `key` after a success.
    pub fn forget(&self, key: &K) {
        self.shared.backoff.forget(key);
    }

    /// Rate-limited requeues of `key` since it last succeeded.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.backoff.failures(key)
    }

    /// Waits for the next key and marks it in flight. Returns `None` once the
    /// queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as no longer in flight, re-queueing it if it was added
    /// while processing.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// True when no key is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }

    /// Drops pending keys and wakes every waiter; `get` returns `None` from now on.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// True after `shut_down`.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_adds_while_in_flight_collapse_to_one_rerun() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();
        for _ in 0..10 {
            q.add("a");
        }
        // Not handed out again while in flight.
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 1);

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("late");
        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some("late"));
    }

    #[tokio::test]
    async fn test_add_after_delays() {
        let q = queue();
        q.add_after("a", Duration::from_millis(20));
        assert!(q.is_empty());
        let got = timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn test_shut_down_unblocks_waiters() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        q.add("a");
        q.shut_down();
        for waiter in waiters {
            let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert!(got.is_none() || got == Some("a"));
        }
        q.add("b");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_rate_limited_requeue_and_forget() {
        let q = queue();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        let got = timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }
}
