//! Fixed-size, direct-mapped reclaim cache (§3.3's "fixed-size
//! open-addressed ring"). Each live object materialized by `dequeue` or
//! `retrieve` occupies exactly one slot, indexed by `data_id % cache_size`.
//! Two live objects that hash to the same slot cannot both be cached at
//! once — one evicts the other even while both are still wanted. §9 Open
//! Question (c) flags this as unresolved-but-tolerated in the source; this
//! crate keeps the direct-mapped behavior literally rather than adding LRU
//! chaining (see DESIGN.md).

use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data_id: u32,
    pub payload: Arc<Vec<u8>>,
    pub locked: bool,
}

pub struct ReclaimCache {
    slots: Vec<Option<CacheEntry>>,
}

impl ReclaimCache {
    pub fn new(size: usize) -> Self {
        Self { slots: vec![None; size] }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn index(&self, data_id: u32) -> usize {
        data_id as usize % self.slots.len()
    }

    /// The entry at `data_id`'s slot, if it's still holding `data_id`.
    pub fn get(&self, data_id: u32) -> Option<&CacheEntry> {
        self.slots[self.index(data_id)].as_ref().filter(|e| e.data_id == data_id)
    }

    pub fn entry_at(&self, idx: usize) -> &Option<CacheEntry> {
        &self.slots[idx]
    }

    pub fn entry_at_mut(&mut self, idx: usize) -> &mut Option<CacheEntry> {
        &mut self.slots[idx]
    }

    pub fn insert(&mut self, data_id: u32, payload: Arc<Vec<u8>>, locked: bool) {
        let idx = self.index(data_id);
        self.slots[idx] = Some(CacheEntry { data_id, payload, locked });
    }

    /// Drop the slot if it still holds `data_id`. No-op otherwise.
    pub fn clear_if_matches(&mut self, data_id: u32) {
        let idx = self.index(data_id);
        if matches!(&self.slots[idx], Some(e) if e.data_id == data_id) {
            self.slots[idx] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_data_ids_evict_each_other() {
        let mut cache = ReclaimCache::new(4);
        cache.insert(1, Arc::new(vec![1]), false);
        assert!(cache.get(1).is_some());
        // data_id 5 maps to the same slot as 1 (5 % 4 == 1 % 4).
        cache.insert(5, Arc::new(vec![5]), false);
        assert!(cache.get(1).is_none());
        assert!(cache.get(5).is_some());
    }

    #[test]
    fn clear_if_matches_is_a_no_op_on_mismatch() {
        let mut cache = ReclaimCache::new(4);
        cache.insert(5, Arc::new(vec![5]), false);
        cache.clear_if_matches(1);
        assert!(cache.get(5).is_some());
        cache.clear_if_matches(5);
        assert!(cache.get(5).is_none());
    }
}
