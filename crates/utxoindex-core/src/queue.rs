//! In-process work queue with a soft ceiling.
//!
//! Producers check [`WorkQueue::is_full`] before taking on new work; a push
//! itself never blocks or drops, so a consumer can always hand a failed batch
//! back with [`WorkQueue::requeue_front`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, item: T) {
        self.items().push_back(item);
    }

    /// Append a group of items contiguously.
    pub fn push_all(&self, items: Vec<T>) {
        self.items().extend(items);
    }

    /// Put items back at the head, preserving their order.
    pub fn requeue_front(&self, items: Vec<T>) {
        let mut queue = self.items();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Room left before the ceiling.
    pub fn headroom(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_keeps_order_ahead_of_new_work() {
        let q = WorkQueue::new(10);
        q.push_all(vec![3, 4]);
        q.requeue_front(vec![1, 2]);
        let drained: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    #[test]
    fn soft_ceiling() {
        let q = WorkQueue::new(2);
        q.push(1);
        assert!(!q.is_full());
        assert_eq!(q.headroom(), 1);
        q.push_all(vec![2, 3]);
        assert!(q.is_full());
        assert_eq!(q.len(), 3);
        assert_eq!(q.headroom(), 0);
    }
}
