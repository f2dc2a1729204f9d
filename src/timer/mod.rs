//! Idle-timeout bookkeeping: a binary min-heap keyed by absolute expiry.
//!
//! Nodes live in a `Vec` ordered as an implicit binary heap; a side table maps
//! each id to its current slot so a node can be adjusted or removed by id in
//! `O(log n)`, not only at the root.
//!
//! Timer actions are plain values. The heap never runs code on its own: when a
//! node fires, its action is handed to the caller-supplied closure, which
//! decides what to do with it (the reactor turns `CloseConnection` actions
//! into connection closes on its own thread).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A single scheduled timeout.
#[derive(Debug, Clone)]
pub struct TimerNode<K, A> {
    pub id: K,
    pub expires: Instant,
    pub action: A,
}

/// Min-heap of timers ordered strictly by expiry instant.
///
/// Every `*_at` method takes the current instant explicitly; the plain
/// variants read the monotonic clock.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
/// use rttpd::timer::TimerHeap;
///
/// let start = Instant::now();
/// let mut timers = TimerHeap::new();
/// timers.add_at(start, 1, Duration::from_millis(100), "one");
/// timers.add_at(start, 2, Duration::from_millis(50), "two");
///
/// let mut fired = Vec::new();
/// let next = timers.next_tick_at(start + Duration::from_millis(60), |id, _| fired.push(id));
/// assert_eq!(fired, vec![2]);
/// assert_eq!(next, Some(Duration::from_millis(40)));
/// ```
#[derive(Debug)]
pub struct TimerHeap<K, A> {
    heap: Vec<TimerNode<K, A>>,
    slots: HashMap<K, usize>,
}

impl<K, A> Default for TimerHeap<K, A> {
    fn default() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash, A> TimerHeap<K, A> {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty heap with room for `capacity` timers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns `true` if a timer for `id` is pending.
    pub fn contains(&self, id: K) -> bool {
        self.slots.contains_key(&id)
    }

    /// The earliest node, if any.
    pub fn peek(&self) -> Option<&TimerNode<K, A>> {
        self.heap.first()
    }

    /// Schedules `action` to fire `timeout` from now, replacing any existing
    /// timer with the same id.
    pub fn add(&mut self, id: K, timeout: Duration, action: A) {
        self.add_at(Instant::now(), id, timeout, action);
    }

    /// [`add`](Self::add) against an explicit clock reading.
    pub fn add_at(&mut self, now: Instant, id: K, timeout: Duration, action: A) {
        let expires = now + timeout;
        match self.slots.get(&id).copied() {
            None => {
                let index = self.heap.len();
                self.slots.insert(id, index);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    action,
                });
                self.sift_up(index);
            }
            Some(index) => {
                let node = &mut self.heap[index];
                node.expires = expires;
                node.action = action;
                let len = self.heap.len();
                if !self.sift_down(index, len) {
                    self.sift_up(index);
                }
            }
        }
    }

    /// Pushes the expiry of `id` to `timeout` from now. Returns `false` when
    /// no such timer exists.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        self.adjust_at(Instant::now(), id, timeout)
    }

    /// [`adjust`](Self::adjust) against an explicit clock reading.
    pub fn adjust_at(&mut self, now: Instant, id: K, timeout: Duration) -> bool {
        let Some(index) = self.slots.get(&id).copied() else {
            return false;
        };
        self.heap[index].expires = now + timeout;
        let len = self.heap.len();
        // Usually the expiry moved later; fall back to sifting up otherwise.
        if !self.sift_down(index, len) {
            self.sift_up(index);
        }
        true
    }

    /// Fires the timer for `id` immediately and removes it.
    /// Returns `false` when no such timer exists.
    pub fn do_work(&mut self, id: K, fire: impl FnOnce(K, A)) -> bool {
        let Some(index) = self.slots.get(&id).copied() else {
            return false;
        };
        let node = self.del(index);
        fire(node.id, node.action);
        true
    }

    /// Removes the timer for `id` without firing it.
    pub fn cancel(&mut self, id: K) -> Option<A> {
        let index = self.slots.get(&id).copied()?;
        Some(self.del(index).action)
    }

    /// Fires every timer whose expiry is not in the future, earliest first.
    pub fn tick(&mut self, fire: impl FnMut(K, A)) {
        self.tick_at(Instant::now(), fire);
    }

    /// [`tick`](Self::tick) against an explicit clock reading.
    pub fn tick_at(&mut self, now: Instant, mut fire: impl FnMut(K, A)) {
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.del(0);
            fire(node.id, node.action);
        }
    }

    /// Fires expired timers, then reports how long until the next one.
    ///
    /// `None` means no timer is pending; the reactor then blocks without a
    /// timeout.
    pub fn next_tick(&mut self, fire: impl FnMut(K, A)) -> Option<Duration> {
        self.next_tick_at(Instant::now(), fire)
    }

    /// [`next_tick`](Self::next_tick) against an explicit clock reading.
    pub fn next_tick_at(&mut self, now: Instant, fire: impl FnMut(K, A)) -> Option<Duration> {
        self.tick_at(now, fire);
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(now))
    }

    /// Removes and returns the root.
    pub fn pop(&mut self) -> Option<TimerNode<K, A>> {
        if self.heap.is_empty() {
            None
        } else {
            Some(self.del(0))
        }
    }

    /// Drops every timer without firing it.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    /// Removes the node stored at heap slot `index`.
    ///
    /// The last node is swapped into the hole and sifted whichever way
    /// restores the heap property.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn del(&mut self, index: usize) -> TimerNode<K, A> {
        assert!(index < self.heap.len(), "timer index out of bounds");
        let node = self.heap.swap_remove(index);
        self.slots.remove(&node.id);
        if index < self.heap.len() {
            self.slots.insert(self.heap[index].id, index);
            let len = self.heap.len();
            if !self.sift_down(index, len) {
                self.sift_up(index);
            }
        }
        node
    }

    fn sift_up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.heap[parent].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(child, parent);
            child = parent;
        }
    }

    /// Sifts the node at `index` down within the first `len` slots. Returns
    /// whether it moved.
    fn sift_down(&mut self, index: usize, len: usize) -> bool {
        let mut parent = index;
        let mut child = parent * 2 + 1;
        while child < len {
            if child + 1 < len && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[parent].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(parent, child);
            parent = child;
            child = parent * 2 + 1;
        }
        parent > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.slots.insert(self.heap[i].id, i);
        self.slots.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_heap_property(&self) {
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.slots[&node.id], i);
            for child in [2 * i + 1, 2 * i + 2] {
                if let Some(c) = self.heap.get(child) {
                    assert!(node.expires <= c.expires, "parent {i} later than child {child}");
                }
            }
        }
        assert_eq!(self.slots.len(), self.heap.len());
    }
}
