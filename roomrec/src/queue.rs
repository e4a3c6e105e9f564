//! Priority-ordered watch queue with lazy deletion.
//!
//! Entries are ordered by `(priority, insertion sequence)` ascending, so
//! insertion order is preserved among equal priorities. Removal is
//! frequent (every reap tombstones an entry) and arbitrary-position
//! removal from a binary heap is not O(log n), so removal only nils the
//! payload; tombstones stay in the backing array until [`WatchQueue::rebuild`]
//! compacts them.
//!
//! The queue is not internally synchronized. Callers guard the whole
//! structure with one mutex, one critical section per call.

use std::collections::HashMap;

/// One heap slot. A tombstoned slot keeps its ordering key (so the heap
/// invariant survives) but has no payload and no index entry.
#[derive(Debug)]
struct QueueEntry<T> {
    priority: u32,
    seq: u64,
    id: String,
    payload: Option<T>,
}

impl<T> QueueEntry<T> {
    fn key(&self) -> (u32, u64) {
        (self.priority, self.seq)
    }
}

/// Priority queue keyed by room id.
///
/// Invariant: `index` and `heap` agree for every live entry; `index`
/// never contains a tombstone.
#[derive(Debug, Default)]
pub struct WatchQueue<T> {
    heap: Vec<QueueEntry<T>>,
    index: HashMap<String, usize>,
    next_seq: u64,
    live: usize,
    dirty: bool,
}

impl<T> WatchQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
            live: 0,
            dirty: false,
        }
    }

    /// Number of live (non-tombstoned) entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Borrow the live payload for `id`, if any.
    pub fn get(&self, id: &str) -> Option<&T> {
        let &pos = self.index.get(id)?;
        self.heap[pos].payload.as_ref()
    }

    /// Insert a payload for `id`. Returns false (leaving the queue
    /// unchanged) if `id` already has a live entry. O(log n).
    pub fn add(&mut self, id: impl Into<String>, priority: u32, payload: T) -> bool {
        let id = id.into();
        if self.index.contains_key(&id) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let pos = self.heap.len();
        self.index.insert(id.clone(), pos);
        self.heap.push(QueueEntry {
            priority,
            seq,
            id,
            payload: Some(payload),
        });
        self.live += 1;
        self.sift_up(pos);
        true
    }

    /// Remove and return the minimum-ordered live payload, discarding any
    /// tombstones encountered at the root. Amortized O(log n).
    pub fn pop(&mut self) -> Option<T> {
        loop {
            if self.heap.is_empty() {
                return None;
            }
            let last = self.heap.len() - 1;
            self.swap(0, last);
            let entry = self.heap.pop()?;
            if !self.heap.is_empty() {
                self.sift_down(0);
            }

            if entry.payload.is_some() {
                self.index.remove(&entry.id);
                self.live -= 1;
                return entry.payload;
            }
            // Tombstone reached the root; discard and keep going.
        }
    }

    /// Tombstone the entry for `id`. The slot stays in the backing array
    /// until the next rebuild. O(1) amortized.
    pub fn remove(&mut self, id: &str) {
        self.pop_specific(id);
    }

    /// As [`WatchQueue::remove`], but returns the payload.
    pub fn pop_specific(&mut self, id: &str) -> Option<T> {
        let pos = self.index.remove(id)?;
        let payload = self.heap[pos].payload.take();
        debug_assert!(payload.is_some());
        self.live -= 1;
        self.dirty = true;
        payload
    }

    /// Compact tombstones out of the backing array and re-establish the
    /// heap invariant. No-op when nothing was removed since the last
    /// rebuild. Callers run this after a batch of removals and before
    /// ordering-sensitive operations such as pruning.
    pub fn rebuild(&mut self) {
        if !self.dirty {
            return;
        }

        self.heap.retain(|e| e.payload.is_some());
        let len = self.heap.len();
        for i in (0..len / 2).rev() {
            self.sift_down(i);
        }

        self.index.clear();
        for (pos, entry) in self.heap.iter().enumerate() {
            self.index.insert(entry.id.clone(), pos);
        }
        self.dirty = false;
    }

    /// If the worst live entry is strictly worse (numerically greater
    /// priority) than `priority`, tombstone it and return its payload.
    /// Used to make room for a higher-priority arrival at the
    /// concurrency ceiling.
    pub fn prune_worse_than(&mut self, priority: u32) -> Option<T> {
        let worst = self
            .heap
            .iter()
            .enumerate()
            .filter(|(_, e)| e.payload.is_some())
            .max_by_key(|(_, e)| e.key())
            .map(|(pos, _)| pos)?;

        if self.heap[worst].priority <= priority {
            return None;
        }

        let id = self.heap[worst].id.clone();
        self.pop_specific(&id)
    }

    /// Live payloads in backing-array order (not sorted order).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().filter_map(|e| e.payload.as_ref())
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        for pos in [a, b] {
            if self.heap[pos].payload.is_some() {
                self.index.insert(self.heap[pos].id.clone(), pos);
            }
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].key() >= self.heap[parent].key() {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = pos * 2 + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap[right].key() < self.heap[left].key() {
                smallest = right;
            }
            if self.heap[pos].key() <= self.heap[smallest].key() {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        // Heap invariant over every slot, tombstones included.
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(self.heap[parent].key() <= self.heap[i].key());
        }
        // Index agrees with the array for every live entry.
        assert_eq!(self.index.len(), self.live);
        for (id, &pos) in &self.index {
            assert_eq!(&self.heap[pos].id, id);
            assert!(self.heap[pos].payload.is_some());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_orders_by_priority_then_insertion() {
        let mut queue = WatchQueue::new();
        assert!(queue.add("b", 5, "b"));
        assert!(queue.add("a", 1, "a"));
        assert!(queue.add("c", 5, "c"));
        assert!(queue.add("d", 3, "d"));
        queue.assert_invariants();

        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("d"));
        // Equal priority: insertion order wins.
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut queue = WatchQueue::new();
        assert!(queue.add("A", 1, "taskA"));
        assert!(!queue.add("A", 5, "taskA2"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some("taskA"));
    }

    #[test]
    fn remove_tombstones_without_compacting() {
        let mut queue = WatchQueue::new();
        queue.add("a", 1, 1);
        queue.add("b", 2, 2);
        queue.add("c", 3, 3);

        queue.remove("a");
        assert_eq!(queue.len(), 2);
        assert!(!queue.contains("a"));
        // The tombstone is still physically present.
        assert_eq!(queue.heap.len(), 3);

        // Pop skips the tombstone.
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn pop_specific_returns_payload() {
        let mut queue = WatchQueue::new();
        queue.add("a", 1, "a");
        queue.add("b", 2, "b");

        assert_eq!(queue.get("b"), Some(&"b"));
        assert_eq!(queue.pop_specific("b"), Some("b"));
        assert_eq!(queue.pop_specific("b"), None);
        assert_eq!(queue.get("b"), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rebuild_compacts_and_reheapifies() {
        let mut queue = WatchQueue::new();
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            queue.add(*id, (10 - i) as u32, *id);
        }
        queue.remove("b");
        queue.remove("d");
        assert!(queue.dirty);

        queue.rebuild();
        assert!(!queue.dirty);
        assert_eq!(queue.heap.len(), 3);
        assert!(queue.heap.iter().all(|e| e.payload.is_some()));
        queue.assert_invariants();

        assert_eq!(queue.pop(), Some("e"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), Some("a"));
    }

    #[test]
    fn readd_after_remove_is_allowed() {
        let mut queue = WatchQueue::new();
        queue.add("a", 1, 1);
        queue.remove("a");
        assert!(queue.add("a", 2, 2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn prune_evicts_strictly_worse_only() {
        let mut queue = WatchQueue::new();
        queue.add("high", 1, "high");
        queue.add("low", 40, "low");

        // Threshold equal to the worst entry: nothing evicted.
        assert_eq!(queue.prune_worse_than(40), None);
        // Strictly better threshold evicts the worst.
        assert_eq!(queue.prune_worse_than(10), Some("low"));
        assert_eq!(queue.len(), 1);
        // Only the best entry remains; nothing worse than 10 exists.
        assert_eq!(queue.prune_worse_than(10), None);
    }

    #[test]
    fn prune_prefers_newest_among_equal_worst() {
        let mut queue = WatchQueue::new();
        queue.add("old", 50, "old");
        queue.add("new", 50, "new");

        assert_eq!(queue.prune_worse_than(1), Some("new"));
        assert_eq!(queue.prune_worse_than(1), Some("old"));
    }

    #[test]
    fn iteration_yields_live_payloads() {
        let mut queue = WatchQueue::new();
        queue.add("a", 1, "a");
        queue.add("b", 2, "b");
        queue.add("c", 3, "c");
        queue.remove("b");

        let mut seen: Vec<_> = queue.iter().copied().collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "c"]);
    }

    #[test]
    fn interleaved_operations_keep_invariants() {
        let mut queue = WatchQueue::new();
        for i in 0..50u32 {
            queue.add(format!("room-{i}"), i % 7, i);
        }
        for i in (0..50u32).step_by(3) {
            queue.remove(&format!("room-{i}"));
        }
        queue.assert_invariants();
        queue.rebuild();
        queue.assert_invariants();

        // Remaining pops come out in nondecreasing key order.
        let mut last_priority = 0;
        let mut popped = 0;
        while let Some(v) = queue.pop() {
            let priority = v % 7;
            assert!(priority >= last_priority);
            last_priority = priority;
            popped += 1;
        }
        assert_eq!(popped, 50 - 50usize.div_ceil(3));
    }
}
