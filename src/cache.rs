//! Domain geometry cache policies.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Result of acquiring a cache block for a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSlot {
    /// Block index assigned to the domain.
    pub block: usize,

    /// True if the domain geometry is already resident.
    pub hit: bool,

    /// Domain evicted to make room, if any. Its geometry must be dropped
    /// before the block is reused.
    pub evicted: Option<usize>,
}

/// Replacement policy over a fixed set of geometry blocks.
///
/// The infinite variant assigns every domain its own block and never evicts;
/// the LRU variant recycles the least recently used unpinned block once
/// capacity is reached. A block stays pinned while intersection against it is
/// in progress.
pub enum CachePolicy {
    Infinite(InfiniteCache),
    Lru(LruCache),
}

impl CachePolicy {
    /// Build the policy for a scene.
    ///
    /// * `ndomains`   - Number of domains.
    /// * `cache_size` - Block capacity; negative selects the infinite cache.
    pub fn new(ndomains: usize, cache_size: i64) -> Self {
        if cache_size < 0 {
            CachePolicy::Infinite(InfiniteCache::new(ndomains))
        } else {
            CachePolicy::Lru(LruCache::new(cache_size.max(1) as usize))
        }
    }

    /// Acquire a block for a domain.
    ///
    /// * `id` - Domain id.
    pub fn acquire(&mut self, id: usize) -> Result<CacheSlot> {
        match self {
            CachePolicy::Infinite(c) => c.acquire(id),
            CachePolicy::Lru(c) => c.acquire(id),
        }
    }

    /// Pin a block against eviction.
    ///
    /// * `block` - Block index.
    pub fn pin(&mut self, block: usize) {
        if let CachePolicy::Lru(c) = self {
            c.pinned[block] = true;
        }
    }

    /// Release a pinned block.
    ///
    /// * `block` - Block index.
    pub fn unpin(&mut self, block: usize) {
        if let CachePolicy::Lru(c) = self {
            c.pinned[block] = false;
        }
    }

    /// Number of blocks the policy may address.
    pub fn capacity(&self) -> usize {
        match self {
            CachePolicy::Infinite(c) => c.ndomains,
            CachePolicy::Lru(c) => c.capacity,
        }
    }
}

/// Block per domain; nothing is ever evicted.
pub struct InfiniteCache {
    ndomains: usize,
    loaded: Vec<bool>,
}

impl InfiniteCache {
    fn new(ndomains: usize) -> Self {
        Self {
            ndomains,
            loaded: vec![false; ndomains],
        }
    }

    fn acquire(&mut self, id: usize) -> Result<CacheSlot> {
        if id >= self.ndomains {
            return Err(Error::CacheFull(format!(
                "domain {id} outside cache budget of {} blocks",
                self.ndomains
            )));
        }
        let hit = self.loaded[id];
        self.loaded[id] = true;
        Ok(CacheSlot {
            block: id,
            hit,
            evicted: None,
        })
    }
}

/// Bounded cache with least-recently-used eviction.
pub struct LruCache {
    capacity: usize,
    map: HashMap<usize, usize>,
    /// Resident domain per block; `usize::MAX` marks a free block.
    resident: Vec<usize>,
    pinned: Vec<bool>,
    /// Domains in recency order, least recent first.
    lru: Vec<usize>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            resident: vec![usize::MAX; capacity],
            pinned: vec![false; capacity],
            lru: Vec::new(),
        }
    }

    fn touch(&mut self, id: usize) {
        self.lru.retain(|&d| d != id);
        self.lru.push(id);
    }

    fn acquire(&mut self, id: usize) -> Result<CacheSlot> {
        if let Some(&block) = self.map.get(&id) {
            self.touch(id);
            return Ok(CacheSlot {
                block,
                hit: true,
                evicted: None,
            });
        }

        // free block first, then the least recently used unpinned one
        let (block, evicted) = if let Some(free) = self.resident.iter().position(|&d| d == usize::MAX)
        {
            (free, None)
        } else {
            let victim = self
                .lru
                .iter()
                .copied()
                .find(|d| !self.pinned[self.map[d]])
                .ok_or_else(|| {
                    Error::CacheFull(format!("all {} cache blocks pinned", self.capacity))
                })?;
            let block = self.map.remove(&victim).unwrap_or_default();
            self.lru.retain(|&d| d != victim);
            (block, Some(victim))
        };

        self.map.insert(id, block);
        self.resident[block] = id;
        self.touch(id);
        Ok(CacheSlot {
            block,
            hit: false,
            evicted,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_never_evicts() {
        let mut c = CachePolicy::new(3, -1);
        for id in 0..3 {
            let slot = c.acquire(id).unwrap();
            assert_eq!(slot.block, id);
            assert!(!slot.hit);
            assert_eq!(slot.evicted, None);
        }
        assert!(c.acquire(1).unwrap().hit);
    }

    #[test]
    fn lru_evicts_least_recent() {
        let mut c = CachePolicy::new(4, 2);
        let a = c.acquire(0).unwrap();
        let b = c.acquire(1).unwrap();
        assert_ne!(a.block, b.block);
        // touch 0 so 1 becomes the victim
        assert!(c.acquire(0).unwrap().hit);
        let s = c.acquire(2).unwrap();
        assert_eq!(s.evicted, Some(1));
        assert_eq!(s.block, b.block);
    }

    #[test]
    fn pinned_blocks_survive() {
        let mut c = CachePolicy::new(4, 2);
        let a = c.acquire(0).unwrap();
        c.acquire(1).unwrap();
        c.pin(a.block);
        // 0 is least recent but pinned; 1 must be chosen
        let s = c.acquire(2).unwrap();
        assert_eq!(s.evicted, Some(1));
        c.unpin(a.block);
        let s = c.acquire(3).unwrap();
        assert_eq!(s.evicted, Some(0));
    }

    #[test]
    fn capacity_one_thrashes_in_order() {
        let mut c = CachePolicy::new(3, 1);
        assert_eq!(c.acquire(0).unwrap().evicted, None);
        assert_eq!(c.acquire(1).unwrap().evicted, Some(0));
        assert_eq!(c.acquire(2).unwrap().evicted, Some(1));
    }

    #[test]
    fn all_pinned_is_cache_full() {
        let mut c = CachePolicy::new(2, 1);
        let a = c.acquire(0).unwrap();
        c.pin(a.block);
        assert!(c.acquire(1).is_err());
    }
}
