use std::collections::{HashMap, VecDeque};

use bitcoin::{BlockHash, Txid};

/// A bounded memo of block txid lists, keyed by block hash so a reorged
/// block naturally misses. Kept across cycles, cleared whenever a cycle
/// errors so the next one starts from fresh chain data.
pub struct BlockCache {
    txids: HashMap<BlockHash, Vec<Txid>>,
    // Insertion order, for eviction
    order: VecDeque<BlockHash>,
    capacity: usize,
}

impl BlockCache {
    pub fn new(capacity: usize) -> BlockCache {
        BlockCache {
            txids: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&[Txid]> {
        self.txids.get(hash).map(|txids| txids.as_slice())
    }

    /// Memoize a block's txids. Once the map exceeds its capacity, the
    /// oldest quarter of the entries is dropped.
    pub fn insert(&mut self, hash: BlockHash, txids: Vec<Txid>) {
        if self.txids.insert(hash, txids).is_none() {
            self.order.push_back(hash);
        }

        if self.order.len() > self.capacity {
            let to_evict = std::cmp::max(self.capacity / 4, 1);
            for _ in 0..to_evict {
                if let Some(old) = self.order.pop_front() {
                    self.txids.remove(&old);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.txids.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    fn dummy_hash(n: u32) -> BlockHash {
        BlockHash::from_str(&format!("{:064x}", n)).expect("Valid block hash hex")
    }

    #[test]
    fn memoization() {
        let mut cache = BlockCache::new(8);
        assert!(cache.is_empty());
        assert!(cache.get(&dummy_hash(1)).is_none());

        cache.insert(dummy_hash(1), vec![]);
        assert_eq!(cache.get(&dummy_hash(1)), Some(&[][..]));
        assert_eq!(cache.len(), 1);

        // Re-inserting the same hash doesn't duplicate the entry
        cache.insert(dummy_hash(1), vec![]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_drops_oldest_quarter() {
        let mut cache = BlockCache::new(8);
        for i in 0..9 {
            cache.insert(dummy_hash(i), vec![]);
        }

        // 9 entries overflowed the capacity of 8: the 2 oldest are gone
        assert_eq!(cache.len(), 7);
        assert!(cache.get(&dummy_hash(0)).is_none());
        assert!(cache.get(&dummy_hash(1)).is_none());
        assert!(cache.get(&dummy_hash(2)).is_some());
        assert!(cache.get(&dummy_hash(8)).is_some());
    }

    #[test]
    fn clearing() {
        let mut cache = BlockCache::new(4);
        cache.insert(dummy_hash(1), vec![]);
        cache.insert(dummy_hash(2), vec![]);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&dummy_hash(1)).is_none());
    }
}
