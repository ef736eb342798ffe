//! Region cache used by the data manager.
//!
//! Memory is accounted in whole blocks by a [`BlockPool`] of fixed
//! capacity. Every cached region holds one pool allocation for as long as it
//! stays cached. Regions are kept in least-recently-used order and may be
//! pinned with a lock counter; pinned regions are never evicted.

use crate::coords::{BlockCoord, VoxelCoord};
use crate::error::{Result, VdcError};
use crate::types::ValueRange;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Stable identifier of a pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocId(usize);

/// Arena of block-granular allocations with a fixed total capacity.
///
/// Slots are recycled through a free list, so an `AllocId` stays valid
/// until it is freed and may be handed out again afterwards.
#[derive(Debug)]
pub struct BlockPool {
    capacity: usize,
    in_use: usize,
    slots: Vec<Option<usize>>,
    free_slots: Vec<usize>,
}

impl BlockPool {
    /// Pool holding at most `capacity` blocks
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: 0,
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Pool sized from a budget in megabytes and the size of one block
    pub fn with_budget(mem_size_mb: usize, block_bytes: usize) -> Self {
        let bytes = mem_size_mb.saturating_mul(1024 * 1024);
        Self::new(bytes / block_bytes.max(1))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    /// Reserve `nblocks` blocks, or `None` if they do not fit
    pub fn alloc(&mut self, nblocks: usize) -> Option<AllocId> {
        if nblocks > self.available() {
            return None;
        }
        self.in_use += nblocks;
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(nblocks);
                slot
            }
            None => {
                self.slots.push(Some(nblocks));
                self.slots.len() - 1
            }
        };
        Some(AllocId(id))
    }

    /// Release an allocation. Freeing an unknown id is a no-op.
    pub fn free(&mut self, id: AllocId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            if let Some(n) = slot.take() {
                self.in_use -= n;
                self.free_slots.push(id.0);
            }
        }
    }

    /// Blocks held by an allocation
    pub fn size_of(&self, id: AllocId) -> Option<usize> {
        self.slots.get(id.0).copied().flatten()
    }

    pub fn clear(&mut self) {
        self.in_use = 0;
        self.slots.clear();
        self.free_slots.clear();
    }
}

/// Sample representation of a cached region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Float32,
    UInt8,
    UInt16,
}

/// Identity of one cached region. At most one entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub timestep: usize,
    pub varname: String,
    pub level: usize,
    pub lod: usize,
    pub bmin: BlockCoord,
    pub bmax: BlockCoord,
    pub kind: DataKind,
}

impl RegionKey {
    pub fn new(
        timestep: usize,
        varname: impl Into<String>,
        level: usize,
        lod: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
    ) -> Self {
        Self {
            timestep,
            varname: varname.into(),
            level,
            lod,
            bmin,
            bmax,
            kind: DataKind::Float32,
        }
    }

    pub fn with_kind(mut self, kind: DataKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of blocks covered by the key's block range
    pub fn num_blocks(&self) -> usize {
        (0..3).map(|i| self.bmax[i] - self.bmin[i] + 1).product()
    }
}

/// Shared buffer of a cached region
#[derive(Debug, Clone)]
pub enum RegionData {
    Float(Arc<Vec<f32>>),
    /// 8- or 16-bit quantized samples, 16-bit values little-endian
    Quantized(Arc<Vec<u8>>),
}

impl RegionData {
    pub fn as_float(&self) -> Option<&Arc<Vec<f32>>> {
        match self {
            RegionData::Float(v) => Some(v),
            RegionData::Quantized(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Arc<Vec<u8>>> {
        match self {
            RegionData::Quantized(v) => Some(v),
            RegionData::Float(_) => None,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: RegionData,
    alloc: AllocId,
    lock_count: usize,
}

/// LRU cache of regions with per-entry lock counters.
///
/// The front of the order list is the least recently used entry and the
/// next eviction candidate. A lookup hit moves the entry to the back.
#[derive(Debug)]
pub struct RegionCache {
    pool: BlockPool,
    entries: HashMap<RegionKey, CacheEntry>,
    order: VecDeque<RegionKey>,
}

impl RegionCache {
    pub fn new(pool: BlockPool) -> Self {
        Self {
            pool,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &RegionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> impl Iterator<Item = &RegionKey> {
        self.order.iter()
    }

    pub fn lock_count(&self, key: &RegionKey) -> Option<usize> {
        self.entries.get(key).map(|e| e.lock_count)
    }

    fn touch(&mut self, key: &RegionKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    /// Look up a region, marking it most recently used and optionally
    /// pinning it
    pub fn get(&mut self, key: &RegionKey, lock: bool) -> Option<RegionData> {
        let data = {
            let entry = self.entries.get_mut(key)?;
            if lock {
                entry.lock_count += 1;
            }
            entry.data.clone()
        };
        self.touch(key);
        Some(data)
    }

    /// Cache `data` under `key`, evicting unlocked least recently used
    /// entries until `nblocks` blocks fit.
    ///
    /// An existing entry for the key is replaced and keeps its lock count.
    pub fn insert(&mut self, key: RegionKey, data: RegionData, nblocks: usize, lock: bool) -> Result<()> {
        if let Some(old) = self.entries.remove(&key) {
            self.pool.free(old.alloc);
            if let Some(pos) = self.order.iter().position(|k| k == &key) {
                self.order.remove(pos);
            }
            let alloc = self.alloc(nblocks)?;
            self.order.push_back(key.clone());
            self.entries.insert(
                key,
                CacheEntry {
                    data,
                    alloc,
                    lock_count: old.lock_count + usize::from(lock),
                },
            );
            return Ok(());
        }

        let alloc = self.alloc(nblocks)?;
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                data,
                alloc,
                lock_count: usize::from(lock),
            },
        );
        Ok(())
    }

    fn alloc(&mut self, nblocks: usize) -> Result<AllocId> {
        if nblocks > self.pool.capacity() {
            return Err(VdcError::CacheExhausted(format!(
                "region of {} blocks exceeds cache capacity of {} blocks",
                nblocks,
                self.pool.capacity()
            )));
        }
        loop {
            if let Some(id) = self.pool.alloc(nblocks) {
                return Ok(id);
            }
            if !self.evict_lru() {
                return Err(VdcError::CacheExhausted(format!(
                    "no evictable region to free {} blocks ({} of {} in use)",
                    nblocks,
                    self.pool.in_use(),
                    self.pool.capacity()
                )));
            }
        }
    }

    /// Evict the least recently used unlocked entry. Returns `false` if
    /// every entry is locked.
    pub fn evict_lru(&mut self) -> bool {
        let pos = self
            .order
            .iter()
            .position(|k| self.entries.get(k).is_some_and(|e| e.lock_count == 0));
        let Some(pos) = pos else {
            return false;
        };
        if let Some(key) = self.order.remove(pos) {
            if let Some(entry) = self.entries.remove(&key) {
                debug!(var = %key.varname, ts = key.timestep, level = key.level, "evicting cached region");
                self.pool.free(entry.alloc);
            }
        }
        true
    }

    /// Pin an entry. Returns `false` if it is not cached.
    pub fn lock(&mut self, key: &RegionKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.lock_count += 1;
                true
            }
            None => false,
        }
    }

    /// Release one pin. Unlocking an unpinned entry is an error.
    pub fn unlock(&mut self, key: &RegionKey) -> Result<()> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.lock_count > 0 => {
                entry.lock_count -= 1;
                Ok(())
            }
            Some(_) => Err(VdcError::State(format!("region of {} is not locked", key.varname))),
            None => Err(VdcError::NotFound(format!("no cached region of {}", key.varname))),
        }
    }

    /// Drop an entry regardless of its lock count
    pub fn remove(&mut self, key: &RegionKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.pool.free(entry.alloc);
                if let Some(pos) = self.order.iter().position(|k| k == key) {
                    self.order.remove(pos);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every entry matching `pred`, returning how many were removed
    pub fn purge<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&RegionKey) -> bool,
    {
        let doomed: Vec<RegionKey> = self.order.iter().filter(|k| pred(k)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.pool.clear();
    }
}

/// Memoized per-variable queries
#[derive(Debug, Default)]
pub struct VarInfoCache {
    exists: HashMap<(usize, String, usize, usize), bool>,
    ranges: HashMap<(usize, String), ValueRange>,
    regions: HashMap<(usize, String, usize), (VoxelCoord, VoxelCoord)>,
}

impl VarInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, ts: usize, var: &str, level: usize, lod: usize) -> Option<bool> {
        self.exists.get(&(ts, var.to_string(), level, lod)).copied()
    }

    pub fn set_exists(&mut self, ts: usize, var: &str, level: usize, lod: usize, exists: bool) {
        self.exists.insert((ts, var.to_string(), level, lod), exists);
    }

    pub fn range(&self, ts: usize, var: &str) -> Option<ValueRange> {
        self.ranges.get(&(ts, var.to_string())).copied()
    }

    pub fn set_range(&mut self, ts: usize, var: &str, range: ValueRange) {
        self.ranges.insert((ts, var.to_string()), range);
    }

    pub fn region(&self, ts: usize, var: &str, level: usize) -> Option<(VoxelCoord, VoxelCoord)> {
        self.regions.get(&(ts, var.to_string(), level)).copied()
    }

    pub fn set_region(&mut self, ts: usize, var: &str, level: usize, region: (VoxelCoord, VoxelCoord)) {
        self.regions.insert((ts, var.to_string(), level), region);
    }

    /// Forget everything known about `var`
    pub fn purge(&mut self, var: &str) {
        self.exists.retain(|k, _| k.1 != var);
        self.ranges.retain(|k, _| k.1 != var);
        self.regions.retain(|k, _| k.1 != var);
    }

    pub fn clear(&mut self) {
        self.exists.clear();
        self.ranges.clear();
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(var: &str, x: usize) -> RegionKey {
        RegionKey::new(0, var, 0, 0, BlockCoord::new(x, 0, 0), BlockCoord::new(x, 0, 0))
    }

    fn data(v: f32) -> RegionData {
        RegionData::Float(Arc::new(vec![v; 4]))
    }

    #[test]
    fn test_pool_recycles_slots() {
        let mut pool = BlockPool::new(4);
        let a = pool.alloc(3).unwrap();
        assert!(pool.alloc(2).is_none());
        pool.free(a);
        assert_eq!(pool.in_use(), 0);
        let b = pool.alloc(4).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.size_of(b), Some(4));
        pool.free(b);
        pool.free(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pool_budget() {
        let pool = BlockPool::with_budget(1, 4096);
        assert_eq!(pool.capacity(), 256);
    }

    #[test]
    fn test_hit_moves_to_back() {
        let mut cache = RegionCache::new(BlockPool::new(8));
        cache.insert(key("a", 0), data(1.0), 1, false).unwrap();
        cache.insert(key("b", 0), data(2.0), 1, false).unwrap();
        assert!(cache.get(&key("a", 0), false).is_some());
        let order: Vec<_> = cache.keys().map(|k| k.varname.clone()).collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn test_eviction_skips_locked() {
        let mut cache = RegionCache::new(BlockPool::new(2));
        cache.insert(key("a", 0), data(1.0), 1, true).unwrap();
        cache.insert(key("b", 0), data(2.0), 1, false).unwrap();
        cache.insert(key("c", 0), data(3.0), 1, false).unwrap();
        assert!(cache.contains(&key("a", 0)));
        assert!(!cache.contains(&key("b", 0)));
        assert!(cache.contains(&key("c", 0)));

        cache.lock(&key("c", 0));
        let err = cache.insert(key("d", 0), data(4.0), 1, false);
        assert!(matches!(err, Err(VdcError::CacheExhausted(_))));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_oversized_region_rejected() {
        let mut cache = RegionCache::new(BlockPool::new(2));
        assert!(matches!(
            cache.insert(key("a", 0), data(1.0), 3, false),
            Err(VdcError::CacheExhausted(_))
        ));
    }

    #[test]
    fn test_unlock_and_purge() {
        let mut cache = RegionCache::new(BlockPool::new(8));
        cache.insert(key("a", 0), data(1.0), 2, true).unwrap();
        cache.insert(key("a", 1), data(1.0), 2, false).unwrap();
        cache.insert(key("b", 0), data(1.0), 2, false).unwrap();
        cache.unlock(&key("a", 0)).unwrap();
        assert!(cache.unlock(&key("a", 0)).is_err());
        assert_eq!(cache.purge(|k| k.varname == "a"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pool().in_use(), 2);
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let mut cache = RegionCache::new(BlockPool::new(4));
        cache.insert(key("a", 0), data(1.0), 2, true).unwrap();
        cache.insert(key("a", 0), data(5.0), 2, false).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lock_count(&key("a", 0)), Some(1));
        let got = cache.get(&key("a", 0), false).unwrap();
        assert_eq!(got.as_float().unwrap()[0], 5.0);
        assert_eq!(cache.pool().in_use(), 2);
    }

    #[test]
    fn test_var_info_purge() {
        let mut info = VarInfoCache::new();
        info.set_exists(0, "a", 1, 0, true);
        info.set_range(0, "a", ValueRange::new(0.0, 1.0));
        info.set_range(0, "b", ValueRange::new(0.0, 2.0));
        info.purge("a");
        assert_eq!(info.exists(0, "a", 1, 0), None);
        assert_eq!(info.range(0, "a"), None);
        assert!(info.range(0, "b").is_some());
    }
}
