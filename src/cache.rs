//! # Log Page Cache
//!
//! A small sharded cache over finalized log pages, used by the read side
//! (record readers, scanners, recovery replay). The write side never reads
//! through it — buffers hold the newest pages — so entries are immutable
//! copies of on-disk pages except for the flusher's write-through updates.
//!
//! ## Eviction
//!
//! SIEVE: each entry has an atomic `visited` flag set on access; the
//! eviction hand clears flags until it finds an unvisited entry and evicts
//! it. Sequential log scans therefore cycle through the cache without
//! displacing the hot pages recovery keeps returning to.
//!
//! Unlike a data-page cache there is no pin protocol: callers copy the
//! page out under the shard lock, so an entry can be evicted the moment
//! the copy completes.
//!
//! ## Sharding
//!
//! Pages hash to one of [`CACHE_SHARD_COUNT`] shards by
//! `file_no * 31 + page_no`, each shard behind its own `RwLock`. The log's
//! access pattern is mostly sequential, so a handful of shards removes the
//! contention a single lock would add without the footprint of a 64-way
//! split.

use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::{CACHE_SHARD_COUNT, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_no: u32,
    pub page_no: u32,
}

impl PageKey {
    pub fn new(file_no: u32, page_no: u32) -> Self {
        Self { file_no, page_no }
    }

    fn shard(&self) -> usize {
        (self.file_no as usize).wrapping_mul(31).wrapping_add(self.page_no as usize)
            % CACHE_SHARD_COUNT
    }
}

struct CacheEntry {
    key: PageKey,
    visited: AtomicBool,
    data: Box<[u8]>,
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<PageKey, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn evict_one(&mut self) {
        debug_assert!(!self.entries.is_empty());
        loop {
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let entry = &self.entries[self.hand];
            if entry.visited.swap(false, Ordering::AcqRel) {
                self.hand += 1;
                continue;
            }
            let idx = self.hand;
            let entry = self.entries.swap_remove(idx);
            self.index.remove(&entry.key);
            if idx < self.entries.len() {
                let moved = self.entries[idx].key;
                self.index.insert(moved, idx);
            }
            return;
        }
    }

    fn insert(&mut self, key: PageKey, data: &[u8]) {
        if let Some(&idx) = self.index.get(&key) {
            self.entries[idx].data.copy_from_slice(data);
            self.entries[idx].visited.store(true, Ordering::Release);
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        let idx = self.entries.len();
        self.entries.push(CacheEntry {
            key,
            visited: AtomicBool::new(false),
            data: data.to_vec().into_boxed_slice(),
        });
        self.index.insert(key, idx);
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
}

impl PageCache {
    pub fn new(total_capacity: usize) -> Result<Self> {
        ensure!(
            total_capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one page per shard)",
            total_capacity,
            CACHE_SHARD_COUNT
        );
        let per_shard = total_capacity / CACHE_SHARD_COUNT;
        let remainder = total_capacity % CACHE_SHARD_COUNT;
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = per_shard + usize::from(i < remainder);
                RwLock::new(CacheShard::new(cap))
            })
            .collect();
        Ok(Self { shards })
    }

    /// Copies the page into `dst`, loading it with `loader` on a miss. The
    /// loaded page is cached for later readers.
    pub fn read_through<F>(&self, key: PageKey, dst: &mut [u8], loader: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        {
            let shard = self.shards[key.shard()].read();
            if let Some(&idx) = shard.index.get(&key) {
                let entry = &shard.entries[idx];
                dst.copy_from_slice(&entry.data);
                entry.visited.store(true, Ordering::Release);
                return Ok(());
            }
        }

        loader(dst)?;
        self.shards[key.shard()].write().insert(key, dst);
        Ok(())
    }

    /// Replaces a cached page with the image just written to disk. A miss
    /// is not populated: the flusher only refreshes what readers already
    /// pulled in.
    pub fn write_through(&self, key: PageKey, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let mut shard = self.shards[key.shard()].write();
        if let Some(&idx) = shard.index.get(&key) {
            shard.entries[idx].data.copy_from_slice(data);
        }
    }

    /// Drops every cached page of `file_no` (purge, truncation).
    pub fn invalidate_file(&self, file_no: u32) {
        for shard in &self.shards {
            let mut shard = shard.write();
            let doomed: Vec<PageKey> = shard
                .index
                .keys()
                .filter(|k| k.file_no == file_no)
                .copied()
                .collect();
            for key in doomed {
                if let Some(idx) = shard.index.remove(&key) {
                    shard.entries.swap_remove(idx);
                    if idx < shard.entries.len() {
                        let moved = shard.entries[idx].key;
                        shard.index.insert(moved, idx);
                    }
                    if shard.hand >= shard.entries.len() {
                        shard.hand = 0;
                    }
                }
            }
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn miss_loads_and_caches() {
        let cache = PageCache::new(16).unwrap();
        let loads = AtomicUsize::new(0);
        let mut dst = vec![0u8; PAGE_SIZE];

        let key = PageKey::new(1, 2);
        cache
            .read_through(key, &mut dst, |buf| {
                loads.fetch_add(1, Ordering::Relaxed);
                buf.copy_from_slice(&page_of(0xAB));
                Ok(())
            })
            .unwrap();
        assert_eq!(dst[100], 0xAB);
        assert_eq!(loads.load(Ordering::Relaxed), 1);

        // Second read hits.
        cache
            .read_through(key, &mut dst, |_| {
                loads.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(loads.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn write_through_updates_only_cached_pages() {
        let cache = PageCache::new(16).unwrap();
        let mut dst = vec![0u8; PAGE_SIZE];
        let key = PageKey::new(1, 2);

        cache.write_through(key, &page_of(0x11));
        assert!(cache.is_empty(), "write-through must not populate");

        cache
            .read_through(key, &mut dst, |buf| {
                buf.copy_from_slice(&page_of(0x22));
                Ok(())
            })
            .unwrap();
        cache.write_through(key, &page_of(0x33));
        cache
            .read_through(key, &mut dst, |_| panic!("should hit"))
            .unwrap();
        assert_eq!(dst[0], 0x33);
    }

    #[test]
    fn eviction_keeps_capacity_bounded() {
        let cache = PageCache::new(CACHE_SHARD_COUNT).unwrap(); // one page per shard
        let mut dst = vec![0u8; PAGE_SIZE];
        for page_no in 0..100 {
            let byte = page_no as u8;
            cache
                .read_through(PageKey::new(1, page_no), &mut dst, |buf| {
                    buf.copy_from_slice(&page_of(byte));
                    Ok(())
                })
                .unwrap();
        }
        assert!(cache.len() <= CACHE_SHARD_COUNT);
    }

    #[test]
    fn invalidate_file_drops_entries() {
        let cache = PageCache::new(16).unwrap();
        let mut dst = vec![0u8; PAGE_SIZE];
        for file_no in 1..=2 {
            for page_no in 1..=3 {
                cache
                    .read_through(PageKey::new(file_no, page_no), &mut dst, |buf| {
                        buf.fill(file_no as u8);
                        Ok(())
                    })
                    .unwrap();
            }
        }
        assert_eq!(cache.len(), 6);
        cache.invalidate_file(1);
        assert_eq!(cache.len(), 3);

        let loads = AtomicUsize::new(0);
        cache
            .read_through(PageKey::new(1, 1), &mut dst, |buf| {
                loads.fetch_add(1, Ordering::Relaxed);
                buf.fill(9);
                Ok(())
            })
            .unwrap();
        assert_eq!(loads.load(Ordering::Relaxed), 1, "invalidated page reloads");
    }
}
