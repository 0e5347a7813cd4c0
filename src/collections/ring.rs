//! Fixed-capacity FIFO queue.

use std::collections::VecDeque;

/// Circular FIFO queue that refuses new items when full.
///
/// Backed by a `VecDeque` allocated once at construction; it never grows.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item. Returns `false` (dropping the item) when full.
    pub fn enqueue(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Remove the oldest item.
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all items.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fifo_order() {
        let mut q = BoundedQueue::new(3);
        assert!(q.enqueue(1));
        assert!(q.enqueue(2));
        assert!(q.enqueue(3));
        assert!(!q.enqueue(4));

        assert_eq!(q.dequeue(), Some(1));
        assert!(q.enqueue(5));
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![2, 3, 5]);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut q = BoundedQueue::new(0);
        assert!(!q.enqueue("a"));
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u32),
        Dequeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u32>().prop_map(Op::Enqueue), Just(Op::Dequeue)]
    }

    proptest! {
        #[test]
        fn prop_matches_reference_model(capacity in 0usize..16, ops in proptest::collection::vec(op(), 0..200)) {
            let mut q = BoundedQueue::new(capacity);
            let mut model: std::collections::VecDeque<u32> = Default::default();

            for op in ops {
                match op {
                    Op::Enqueue(v) => {
                        let was_full = model.len() == capacity;
                        let accepted = q.enqueue(v);
                        prop_assert_eq!(accepted, !was_full);
                        if accepted {
                            model.push_back(v);
                        }
                    }
                    Op::Dequeue => {
                        prop_assert_eq!(q.dequeue(), model.pop_front());
                    }
                }
                prop_assert!(q.len() <= capacity);
                prop_assert_eq!(q.len(), model.len());
            }
        }
    }
}
