//! Bounded relay dedup cache.
//!
//! Remembers message ids this node already processed so a flooded envelope
//! is forwarded at most once. Insertion order is kept in a ring; once the
//! bound is exceeded the oldest half is evicted in one pass, which keeps
//! the amortized cost per insert constant.

use std::collections::{HashSet, VecDeque};

use meshrelay_shared::types::MessageId;

#[derive(Debug)]
pub struct SeenMessageCache {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl SeenMessageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            ids: HashSet::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);

        if self.order.len() > self.capacity {
            let keep = self.capacity / 2;
            while self.order.len() > keep {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_duplicate() {
        let mut cache = SeenMessageCache::new(10);
        let id = MessageId::new();
        assert!(cache.insert(id));
        assert!(!cache.insert(id));
        assert!(cache.contains(&id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_never_exceeds_bound() {
        let mut cache = SeenMessageCache::new(100);
        for _ in 0..1_000 {
            cache.insert(MessageId::new());
            assert!(cache.len() <= cache.capacity());
        }
    }

    #[test]
    fn test_evicts_oldest_half() {
        let mut cache = SeenMessageCache::new(4);
        let ids: Vec<MessageId> = (0..5).map(|_| MessageId::new()).collect();
        for id in &ids {
            cache.insert(*id);
        }

        // Fifth insert overflowed: only the two newest survive
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&ids[0]));
        assert!(!cache.contains(&ids[2]));
        assert!(cache.contains(&ids[3]));
        assert!(cache.contains(&ids[4]));

        // An evicted id is accepted again
        assert!(cache.insert(ids[0]));
    }
}
