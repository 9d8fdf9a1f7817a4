//! FIFO queue that ignores items already waiting in it.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// First-in first-out set.
///
/// Pushing an item that is already queued is a no-op; once popped, the
/// item may be queued again.
#[derive(Debug, Clone)]
pub struct UniqueQueue<T> {
    items: VecDeque<T>,
    queued: HashSet<T>,
}

impl<T: Eq + Hash + Clone> UniqueQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    /// Returns `false` if the item was already queued.
    pub fn push(&mut self, item: T) -> bool {
        if !self.queued.insert(item.clone()) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.queued.remove(&item);
        Some(item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.queued.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Eq + Hash + Clone> Default for UniqueQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> Extend<T> for UniqueQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = UniqueQueue::new();
        queue.extend([3, 1, 2]);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_duplicates_rejected_while_queued() {
        let mut queue = UniqueQueue::new();
        assert!(queue.push("a"));
        assert!(!queue.push("a"));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Some("a"));
        assert!(!queue.contains(&"a"));
        assert!(queue.push("a"));
    }
}
