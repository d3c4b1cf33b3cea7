//! Keyed, bounded retry store
//!
//! Holds work items that could not be queued or failed processing. Items
//! are addressed by their natural key, so a second failure for the same key
//! replaces the first instead of doubling up. The scavenger takes items out
//! oldest first and re-enqueues them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Event plus the number of times it has been deferred
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    /// Event
    pub event: T,

    /// Times this event was sent to the retry store
    pub attempts: u32,
}

impl<T> WorkItem<T> {
    /// Fresh item
    pub fn new(event: T) -> Self {
        Self { event, attempts: 0 }
    }

    /// Same event with one more deferral counted
    pub fn deferred(self) -> Self {
        Self {
            event: self.event,
            attempts: self.attempts.saturating_add(1),
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    item: WorkItem<T>,
    seq: u64,
}

#[derive(Debug)]
struct Slots<K, T> {
    by_key: HashMap<K, Slot<T>>,
    next_seq: u64,
}

/// Bounded store of deferred items
#[derive(Debug)]
pub struct RetryStore<K, T> {
    capacity: usize,
    slots: Mutex<Slots<K, T>>,
}

impl<K: Eq + Hash + Clone, T> RetryStore<K, T> {
    /// Empty store holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Slots {
                by_key: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Maximum keys held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `item` under `key`; hands the item back when the store is full
    pub fn insert(&self, key: K, item: WorkItem<T>) -> Result<(), WorkItem<T>> {
        let mut slots = self.slots.lock();
        if !slots.by_key.contains_key(&key) && slots.by_key.len() >= self.capacity {
            return Err(item);
        }
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.by_key.insert(key, Slot { item, seq });
        Ok(())
    }

    /// Remove and return every item, oldest first
    pub fn take_all(&self) -> Vec<(K, WorkItem<T>)> {
        let mut drained: Vec<_> = self.slots.lock().by_key.drain().collect();
        drained.sort_by_key(|(_, slot)| slot.seq);
        drained
            .into_iter()
            .map(|(key, slot)| (key, slot.item))
            .collect()
    }

    /// Whether `key` is waiting
    pub fn contains(&self, key: &K) -> bool {
        self.slots.lock().by_key.contains_key(key)
    }

    /// Deferral count for `key`, if waiting
    pub fn attempts(&self, key: &K) -> Option<u32> {
        self.slots.lock().by_key.get(key).map(|slot| slot.item.attempts)
    }

    /// Items waiting
    pub fn len(&self) -> usize {
        self.slots.lock().by_key.len()
    }

    /// No items waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_rejects_new_keys_when_full() {
        let store = RetryStore::new(2);
        assert!(store.insert(1, WorkItem::new("a")).is_ok());
        assert!(store.insert(2, WorkItem::new("b")).is_ok());

        let rejected = store.insert(3, WorkItem::new("c")).unwrap_err();
        assert_eq!(rejected.event, "c");

        // Same key replaces in place even when full
        assert!(store.insert(1, WorkItem::new("a2").deferred()).is_ok());
        assert_eq!(store.len(), 2);
        assert_eq!(store.attempts(&1), Some(1));
    }

    #[test]
    fn test_take_all_is_oldest_first_and_empties() {
        let store = RetryStore::new(10);
        for key in [5, 1, 3] {
            store.insert(key, WorkItem::new(key)).unwrap();
        }
        let keys: Vec<i32> = store.take_all().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![5, 1, 3]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_deferred_counts_attempts() {
        let item = WorkItem::new(()).deferred().deferred();
        assert_eq!(item.attempts, 2);
    }
}
