//! Cache of block bodies keyed by identifier.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Block bodies a node has seen, by identifier.
///
/// Applications riding on the simulation use this to deduplicate gossip:
/// a body is only worth forwarding the first time it arrives.
#[derive(Clone, Debug, Default)]
pub struct BlockCache {
    blocks: BTreeMap<u64, Bytes>,
}

impl BlockCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a body under `id`, returning whether the identifier was new.
    /// The latest body wins either way.
    pub fn insert(&mut self, id: u64, body: Bytes) -> bool {
        self.blocks.insert(id, body).is_none()
    }

    /// Body stored under `id`, if any.
    pub fn get(&self, id: u64) -> Option<&Bytes> {
        self.blocks.get(&id)
    }

    /// Whether a body is stored under `id`.
    pub fn contains(&self, id: u64) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Number of stored bodies.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut cache = BlockCache::new();
        assert!(cache.is_empty());
        assert!(cache.insert(1, Bytes::from_static(b"genesis")));
        assert!(cache.insert(2, Bytes::from_static(b"next")));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(1));
        assert!(!cache.contains(3));
        assert_eq!(cache.get(2).unwrap().as_ref(), b"next");
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn duplicate_insert_keeps_latest_body() {
        let mut cache = BlockCache::new();
        assert!(cache.insert(1, Bytes::from_static(b"old")));
        assert!(!cache.insert(1, Bytes::from_static(b"new")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1).unwrap().as_ref(), b"new");
    }
}
