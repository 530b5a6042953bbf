use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, hash::Hash, sync::Arc};
use tokio::{sync::Notify, time};

/// A rate-limited work queue of keys.
///
/// A key is held at most once while waiting, and is never handed to two
/// workers at once: a key added while it is being processed is queued again
/// once the worker calls [`Queue::done`].
#[derive(Debug)]
pub struct Queue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    base_delay: time::Duration,
    max_delay: time::Duration,
}

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    requeues: HashMap<K, u32>,
    shutdown: bool,
}

// === impl Queue ===

impl<K> Default for Queue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new(Self::BASE_DELAY, Self::MAX_DELAY)
    }
}

impl<K> Queue<K>
where
    K: Clone + Eq + Hash,
{
    pub const BASE_DELAY: time::Duration = time::Duration::from_millis(5);
    pub const MAX_DELAY: time::Duration = time::Duration::from_secs(1000);

    pub fn new(base_delay: time::Duration, max_delay: time::Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                requeues: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutdown || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting the state so that an add
            // racing with this check still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutdown {
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

    /// Marks a key as processed, queueing it again if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Adds the key after a delay that grows exponentially with the number of
    /// times it has been requeued.
    pub fn add_rate_limited(self: &Arc<Self>, key: K)
    where
        K: Send + 'static,
    {
        let delay = self.next_delay(&key);
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(key);
            }
        });
    }

    pub fn forget(&self, key: &K) {
        self.state.lock().requeues.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().requeues.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Wakes all waiting workers, which then observe the shutdown and exit.
    /// Pending keys are abandoned.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn next_delay(&self, key: &K) -> time::Duration {
        let mut state = self.state.lock();
        let requeues = state.requeues.entry(key.clone()).or_default();
        let exp = *requeues;
        *requeues = requeues.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
