//! Fixed-capacity min-priority queue with duplicate suppression.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::hash::Hash;

/// Heap entry ordered by priority only.
#[derive(Debug, Clone)]
struct Entry<P, T> {
    priority: P,
    /// Insertion sequence; breaks priority ties in FIFO order.
    seq: u64,
    value: T,
}

impl<P: Ord, T> PartialEq for Entry<P, T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<P: Ord, T> Eq for Entry<P, T> {}

impl<P: Ord, T> PartialOrd for Entry<P, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Ord, T> Ord for Entry<P, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Binary-heap priority queue serving the *lowest* priority first.
///
/// Values are unique: enqueuing a value already present is rejected, as is
/// enqueuing into a full queue.
#[derive(Debug, Clone)]
pub struct BoundedPriorityQueue<T, P> {
    heap: BinaryHeap<Reverse<Entry<P, T>>>,
    present: HashSet<T>,
    capacity: usize,
    next_seq: u64,
}

impl<T, P> BoundedPriorityQueue<T, P>
where
    T: Eq + Hash + Clone,
    P: Ord,
{
    /// Create an empty queue holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            present: HashSet::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    /// Insert `value`. Returns `false` if full or already present.
    pub fn enqueue(&mut self, value: T, priority: P) -> bool {
        if self.is_full() || self.present.contains(&value) {
            return false;
        }
        self.present.insert(value.clone());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { priority, seq, value }));
        true
    }

    /// Remove and return the minimum-priority value.
    pub fn dequeue(&mut self) -> Option<(T, P)> {
        let Reverse(entry) = self.heap.pop()?;
        self.present.remove(&entry.value);
        Some((entry.value, entry.priority))
    }

    /// Minimum-priority value without removing it.
    pub fn peek(&self) -> Option<(&T, &P)> {
        self.heap.peek().map(|Reverse(e)| (&e.value, &e.priority))
    }

    /// Whether `value` is queued.
    pub fn contains(&self, value: &T) -> bool {
        self.present.contains(value)
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether at capacity.
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Maximum number of values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keep the `capacity` highest-priority values seen.
    ///
    /// When full, `value` replaces the current minimum only if it ranks
    /// strictly higher. Returns whether `value` is now queued.
    pub fn offer_top(&mut self, value: T, priority: P) -> bool {
        if self.present.contains(&value) || self.capacity == 0 {
            return false;
        }
        if self.is_full() {
            let beats_min = matches!(self.peek(), Some((_, min)) if priority > *min);
            if !beats_min {
                return false;
            }
            self.dequeue();
        }
        self.enqueue(value, priority)
    }

    /// Drain everything, highest priority first.
    pub fn into_sorted_desc(mut self) -> Vec<(T, P)> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(item) = self.dequeue() {
            out.push(item);
        }
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_serves_minimum_first() {
        let mut q = BoundedPriorityQueue::new(4);
        assert!(q.enqueue("c", 3));
        assert!(q.enqueue("a", 1));
        assert!(q.enqueue("b", 2));

        assert_eq!(q.dequeue(), Some(("a", 1)));
        assert_eq!(q.dequeue(), Some(("b", 2)));
        assert_eq!(q.dequeue(), Some(("c", 3)));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_rejects_duplicates_and_overflow() {
        let mut q = BoundedPriorityQueue::new(2);
        assert!(q.enqueue("a", 5));
        assert!(!q.enqueue("a", 1));
        assert!(q.enqueue("b", 2));
        assert!(!q.enqueue("c", 0));
        assert_eq!(q.len(), 2);

        // Dequeued values may be enqueued again.
        q.dequeue();
        assert!(q.enqueue("b", 7));
    }

    #[test]
    fn test_offer_top_keeps_best() {
        let mut q = BoundedPriorityQueue::new(3);
        for (v, p) in [("a", 5), ("b", 1), ("c", 9), ("d", 3), ("e", 7)] {
            q.offer_top(v, p);
        }
        let kept: Vec<_> = q.into_sorted_desc().into_iter().map(|(v, _)| v).collect();
        assert_eq!(kept, vec!["c", "e", "a"]);
    }

    #[test]
    fn test_equal_priorities_fifo() {
        let mut q = BoundedPriorityQueue::new(3);
        q.enqueue("first", 1);
        q.enqueue("second", 1);
        assert_eq!(q.dequeue().map(|(v, _)| v), Some("first"));
    }

    proptest! {
        #[test]
        fn prop_dequeue_returns_minimum(
            capacity in 1usize..32,
            items in proptest::collection::vec((0u8..40, any::<i16>()), 0..100),
        ) {
            let mut q = BoundedPriorityQueue::new(capacity);
            let mut model: std::collections::HashMap<u8, i16> = Default::default();

            for (value, priority) in items {
                let accepted = q.enqueue(value, priority);
                let expected = model.len() < capacity && !model.contains_key(&value);
                prop_assert_eq!(accepted, expected);
                if accepted {
                    model.insert(value, priority);
                }
                prop_assert!(q.len() <= capacity);
            }

            while let Some((value, priority)) = q.dequeue() {
                let min = model.values().copied().min().unwrap();
                prop_assert_eq!(priority, min);
                prop_assert_eq!(model.remove(&value), Some(priority));
            }
            prop_assert!(model.is_empty());
        }
    }
}
