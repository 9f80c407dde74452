//! Per-key buffer of pending items with timeout escalation.
//!
//! The queue imposes no ordering of its own: callers decide which buffered
//! item to take next. Each pushed item arms a timer; when it fires and the item
//! is still buffered, the caller's escalation callback runs with the number of
//! times the timer has fired so far and decides whether to re-arm it.
//!
//! Removing an item cancels its timer implicitly: a firing timer that no
//! longer finds its item simply ends.
//!
//! # Example
//!
//! ```no_run
//! use denormalizer_runtime::order_queue::{Escalation, OrderQueue};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let queue = OrderQueue::new(Duration::from_millis(100));
//!
//! queue.push("user-1", "evt-3", 3_u64, |loop_count| async move {
//!     if loop_count < 3 { Escalation::Rearm } else { Escalation::Stop }
//! });
//!
//! assert_eq!(queue.get("user-1").map(|items| items.len()), Some(1));
//! queue.remove("user-1", "evt-3");
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What to do after an escalation callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Arm the same timer again.
    Rearm,
    /// Let the timer lapse.
    Stop,
}

/// One buffered item.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem<T> {
    /// Caller-supplied identity (event id).
    pub id: String,
    /// The buffered value.
    pub item: T,
    ticket: u64,
}

#[derive(Debug)]
struct QueueState<T> {
    entries: HashMap<String, Vec<QueuedItem<T>>>,
    loops: HashMap<(String, String), u32>,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            loops: HashMap::new(),
        }
    }
}

/// Per-key ordered buffer with escalation timers.
#[derive(Debug)]
pub struct OrderQueue<T> {
    timeout: Duration,
    state: Arc<Mutex<QueueState<T>>>,
    tickets: AtomicU64,
}

impl<T> OrderQueue<T>
where
    T: Clone + Send + 'static,
{
    /// Create a queue whose timers fire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(QueueState::default())),
            tickets: AtomicU64::new(0),
        }
    }

    /// The escalation timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Append `item` under `key` and arm its escalation timer.
    ///
    /// Returns `false` (and arms nothing) if an item with the same `id` is
    /// already buffered under `key`.
    ///
    /// # Notes
    ///
    /// - The timer is a spawned task, so this must run inside a Tokio runtime
    pub fn push<F, Fut>(&self, key: &str, id: &str, item: T, on_timeout: F) -> bool
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Escalation> + Send + 'static,
    {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = lock(&self.state);
            let items = state.entries.entry(key.to_string()).or_default();
            if items.iter().any(|queued| queued.id == id) {
                return false;
            }
            items.push(QueuedItem {
                id: id.to_string(),
                item,
                ticket,
            });
        }

        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        let key = key.to_string();
        let id = id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;

                let Some(loop_count) = tick(&state, &key, &id, ticket) else {
                    return;
                };

                if on_timeout(loop_count).await == Escalation::Stop {
                    return;
                }
            }
        });

        true
    }

    /// Items buffered under `key`, in push order.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<QueuedItem<T>>> {
        lock(&self.state)
            .entries
            .get(key)
            .filter(|items| !items.is_empty())
            .cloned()
    }

    /// The buffered item `id` under `key`, if present.
    #[must_use]
    pub fn find(&self, key: &str, id: &str) -> Option<T> {
        lock(&self.state)
            .entries
            .get(key)
            .and_then(|items| items.iter().find(|queued| queued.id == id))
            .map(|queued| queued.item.clone())
    }

    /// Remove item `id` and reset its loop counter. Idempotent.
    pub fn remove(&self, key: &str, id: &str) -> Option<T> {
        let mut state = lock(&self.state);
        state.loops.remove(&(key.to_string(), id.to_string()));

        let items = state.entries.get_mut(key)?;
        let position = items.iter().position(|queued| queued.id == id)?;
        let removed = items.remove(position);
        if items.is_empty() {
            state.entries.remove(key);
        }
        Some(removed.item)
    }

    /// Remove and return the first item under `key` matching `predicate`.
    pub fn take_first<P>(&self, key: &str, predicate: P) -> Option<QueuedItem<T>>
    where
        P: Fn(&T) -> bool,
    {
        let mut state = lock(&self.state);
        let items = state.entries.get_mut(key)?;
        let position = items.iter().position(|queued| predicate(&queued.item))?;
        let taken = items.remove(position);
        if items.is_empty() {
            state.entries.remove(key);
        }
        state.loops.remove(&(key.to_string(), taken.id.clone()));
        Some(taken)
    }

    /// Number of times the timer of item `id` has fired.
    #[must_use]
    pub fn loop_count(&self, key: &str, id: &str) -> u32 {
        lock(&self.state)
            .loops
            .get(&(key.to_string(), id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Drop everything buffered under `key`.
    pub fn clear(&self, key: &str) {
        let mut state = lock(&self.state);
        state.entries.remove(key);
        state.loops.retain(|(loop_key, _), _| loop_key != key);
    }

    /// Total number of buffered items across all keys.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).entries.values().map(Vec::len).sum()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(state: &Mutex<QueueState<T>>) -> std::sync::MutexGuard<'_, QueueState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bump the loop counter of a still-buffered item; `None` once it is gone.
fn tick<T>(state: &Mutex<QueueState<T>>, key: &str, id: &str, ticket: u64) -> Option<u32> {
    let mut state = lock(state);
    let present = state
        .entries
        .get(key)
        .is_some_and(|items| items.iter().any(|q| q.id == id && q.ticket == ticket));
    if !present {
        return None;
    }
    let counter = state
        .loops
        .entry((key.to_string(), id.to_string()))
        .or_insert(0);
    *counter += 1;
    Some(*counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn never(_: u32) -> std::future::Ready<Escalation> {
        std::future::ready(Escalation::Stop)
    }

    #[tokio::test]
    async fn push_get_remove() {
        let queue = OrderQueue::new(Duration::from_secs(60));
        assert!(queue.push("a", "e2", 2, never));
        assert!(queue.push("a", "e3", 3, never));

        let items = queue.get("a").unwrap_or_default();
        assert_eq!(items.iter().map(|q| q.item).collect::<Vec<_>>(), vec![2, 3]);

        assert_eq!(queue.remove("a", "e2"), Some(2));
        assert_eq!(queue.remove("a", "e2"), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.get("b").is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_not_buffered_twice() {
        let queue = OrderQueue::new(Duration::from_secs(60));
        assert!(queue.push("a", "e2", 2, never));
        assert!(!queue.push("a", "e2", 2, never));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn take_first_uses_predicate() {
        let queue = OrderQueue::new(Duration::from_secs(60));
        queue.push("a", "e4", 4, never);
        queue.push("a", "e2", 2, never);

        let taken = queue.take_first("a", |rev| *rev == 2);
        assert_eq!(taken.map(|q| q.id), Some("e2".to_string()));
        assert!(queue.take_first("a", |rev| *rev == 3).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearms_until_stopped() {
        let queue = OrderQueue::new(Duration::from_millis(50));
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        queue.push("a", "e2", 2, move |loop_count| {
            fired_clone.store(loop_count, Ordering::SeqCst);
            std::future::ready(if loop_count < 3 {
                Escalation::Rearm
            } else {
                Escalation::Stop
            })
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(queue.loop_count("a", "e2"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_item_cancels_timer() {
        let queue = OrderQueue::new(Duration::from_millis(50));
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        queue.push("a", "e2", 2, move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Escalation::Rearm)
        });
        queue.remove("a", "e2");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(queue.loop_count("a", "e2"), 0);
    }
}
