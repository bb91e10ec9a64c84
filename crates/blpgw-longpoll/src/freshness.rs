//! Recency-ordered key/value store with idle eviction.
//!
//! Entries live in an arena (`Vec` of slots plus a free list) linked by
//! index into a doubly-linked recency list: head is most recently used, tail
//! least. Touching an entry relinks it at the head in O(1). The reaper walks
//! from the tail and stops at the first entry younger than the expiration
//! threshold.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A value that may refuse eviction while in use.
pub trait Expirable {
    /// Release resources and return `true`, or return `false` to stay.
    fn expire(&self) -> bool;
}

impl<T: Expirable + ?Sized> Expirable for Arc<T> {
    fn expire(&self) -> bool {
        (**self).expire()
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    touched: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Lru<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> Lru<K, V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn touch(&mut self, slot: usize, now: Instant) {
        self.unlink(slot);
        self.push_front(slot);
        if let Some(node) = self.node_mut(slot) {
            node.touched = now;
        }
    }

    fn insert(&mut self, key: K, value: V, now: Instant) -> usize {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.node_mut(slot) {
                node.value = value;
            }
            self.touch(slot, now);
            return slot;
        }
        let node = Node {
            key: key.clone(),
            value,
            touched: now,
            prev: None,
            next: None,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(node);
            slot
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        };
        let _ = self.index.insert(key, slot);
        self.push_front(slot);
        slot
    }

    fn remove_slot(&mut self, slot: usize) -> Option<V> {
        self.unlink(slot);
        let node = self.slots.get_mut(slot)?.take()?;
        let _ = self.index.remove(&node.key);
        self.free.push(slot);
        Some(node.value)
    }
}

/// Key → value map ordered by last touch, with a background reaper.
pub struct FreshnessStore<K, V> {
    lru: Mutex<Lru<K, V>>,
    expiration: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> FreshnessStore<K, V> {
    /// Store whose entries become eligible for eviction after `expiration` idle.
    pub fn new(expiration: Duration) -> Self {
        Self {
            lru: Mutex::new(Lru::new()),
            expiration,
        }
    }

    /// Idle threshold.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Insert or replace `key`, making it most recently used.
    pub fn set(&self, key: K, value: V) {
        let _ = self.lru.lock().insert(key, value, Instant::now());
    }

    /// Value for `key`, touching it.
    pub fn get(&self, key: &K) -> Option<V> {
        self.with_entry(key, V::clone)
    }

    /// Touch `key` and run `f` on its value while the store is locked, so the
    /// reaper cannot evict it between lookup and `f`.
    pub fn with_entry<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        let mut lru = self.lru.lock();
        let slot = *lru.index.get(key)?;
        lru.touch(slot, Instant::now());
        lru.node(slot).map(|node| f(&node.value))
    }

    /// Like [`with_entry`](Self::with_entry), inserting `make()` first if
    /// `key` is absent.
    pub fn with_entry_or_insert<R>(
        &self,
        key: &K,
        make: impl FnOnce() -> V,
        f: impl FnOnce(&V) -> R,
    ) -> Option<R> {
        let mut lru = self.lru.lock();
        let now = Instant::now();
        let slot = if let Some(&slot) = lru.index.get(key) {
            lru.touch(slot, now);
            slot
        } else {
            lru.insert(key.clone(), make(), now)
        };
        lru.node(slot).map(|node| f(&node.value))
    }

    /// Remove `key`.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut lru = self.lru.lock();
        let slot = *lru.index.get(key)?;
        lru.remove_slot(slot)
    }

    /// Remove `key` if `pred` holds for its value, checked under the lock.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut lru = self.lru.lock();
        let slot = *lru.index.get(key)?;
        if !lru.node(slot).is_some_and(|node| pred(&node.value)) {
            return None;
        }
        lru.remove_slot(slot)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lru.lock().index.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        let lru = self.lru.lock();
        let mut keys = Vec::with_capacity(lru.index.len());
        let mut cursor = lru.head;
        while let Some(slot) = cursor {
            let Some(node) = lru.node(slot) else { break };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

impl<K: Eq + Hash + Clone, V: Clone + Expirable> FreshnessStore<K, V> {
    /// One reaper pass at `now`. Returns how many entries were evicted.
    ///
    /// Entries idle for at least the threshold are asked to expire; those that
    /// refuse are renewed instead.
    pub fn reap(&self, now: Instant) -> usize {
        let mut lru = self.lru.lock();
        let mut evicted = 0;
        // renewed entries move to the head, so each entry is visited at most once
        let mut budget = lru.index.len();
        while budget > 0 {
            budget -= 1;
            let Some(slot) = lru.tail else { break };
            let Some(node) = lru.node(slot) else { break };
            if now.saturating_duration_since(node.touched) < self.expiration {
                break;
            }
            if node.value.expire() {
                let _ = lru.remove_slot(slot);
                evicted += 1;
            } else {
                lru.touch(slot, now);
            }
        }
        evicted
    }

    /// Run [`reap`](Self::reap) every `tick` until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, tick: Duration, cancel: CancellationToken) -> JoinHandle<()>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = store.reap(Instant::now());
                        if evicted > 0 {
                            metrics::counter!("blpgw_api_sessions_reaped_total").increment(evicted as u64);
                            debug!(evicted, remaining = store.len(), "reaped idle entries");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
