//! Block cache shared by datasets and their prefetch workers.
//!
//! Decoded blocks are keyed by [`BlockKey`]. Access always goes through a
//! [`LockedBlock`], which grants exclusive access to one block until it is
//! dropped. Eviction never touches a locked block.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::trace;

use crate::config;
use crate::errors::{Jp2Error, Result};

/// Identity of the block owner: a dataset or one of its overview levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(u64);

impl DatasetId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DatasetId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub dataset: DatasetId,
    /// 1-based band index.
    pub band: usize,
    pub col: usize,
    pub row: usize,
}

#[derive(Debug, Default)]
struct BlockData {
    data: Vec<u8>,
    filled: bool,
}

type SharedBlock = Arc<Mutex<BlockData>>;

struct Entry {
    block: SharedBlock,
    size: usize,
}

struct CacheState {
    entries: LruCache<BlockKey, Entry>,
    used: usize,
}

impl CacheState {
    fn remove_if_same(&mut self, key: &BlockKey, block: &SharedBlock) {
        let same = self
            .entries
            .peek(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.block, block));
        if same {
            if let Some(entry) = self.entries.pop(key) {
                self.used = self.used.saturating_sub(entry.size);
            }
        }
    }

    /// Evict unlocked blocks, least recently used first, until `incoming`
    /// more bytes fit in `budget`.
    fn make_room(&mut self, incoming: usize, budget: usize) {
        if self.used + incoming <= budget {
            return;
        }
        let victims: Vec<BlockKey> = self
            .entries
            .iter()
            .rev()
            .filter(|(_, entry)| Arc::strong_count(&entry.block) == 1)
            .scan(self.used + incoming, |pending, (key, entry)| {
                if *pending <= budget {
                    None
                } else {
                    *pending = pending.saturating_sub(entry.size);
                    Some(*key)
                }
            })
            .collect();
        for key in victims {
            if let Some(entry) = self.entries.pop(&key) {
                self.used = self.used.saturating_sub(entry.size);
                trace!(?key, "evicted block");
            }
        }
    }

    /// Insert a fresh block, locked before anybody else can see it.
    fn insert_locked(
        &mut self,
        key: BlockKey,
        size: usize,
        budget: usize,
    ) -> ArcMutexGuard<RawMutex, BlockData> {
        self.make_room(size, budget);
        let block: SharedBlock = Arc::new(Mutex::new(BlockData {
            data: vec![0; size],
            filled: false,
        }));
        let guard = block.lock_arc();
        self.entries.put(key, Entry { block, size });
        self.used += size;
        guard
    }
}

/// Exclusive access to one cached block.
///
/// Dropping the guard releases the lock. A block that was never marked as
/// filled is removed from the cache on release.
pub struct LockedBlock {
    key: BlockKey,
    guard: ArcMutexGuard<RawMutex, BlockData>,
    state: Arc<Mutex<CacheState>>,
    budget: Arc<AtomicUsize>,
}

impl LockedBlock {
    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn is_filled(&self) -> bool {
        self.guard.filled
    }

    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }

    pub fn mark_filled(&mut self) {
        self.guard.filled = true;
        let block = ArcMutexGuard::mutex(&self.guard).clone();
        let mut state = self.state.lock();
        // Another thread may have dropped the unfilled entry while we waited
        // for the lock; publish the data again.
        if !state.entries.contains(&self.key) {
            let size = self.guard.data.len();
            state.make_room(size, self.budget.load(Ordering::Relaxed));
            state.entries.put(self.key, Entry { block, size });
            state.used += size;
        }
    }
}

impl Drop for LockedBlock {
    fn drop(&mut self) {
        if !self.guard.filled {
            let block = ArcMutexGuard::mutex(&self.guard);
            self.state.lock().remove_if_same(&self.key, block);
        }
    }
}

impl std::fmt::Debug for LockedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedBlock")
            .field("key", &self.key)
            .field("filled", &self.guard.filled)
            .finish()
    }
}

/// Storage for decoded blocks.
pub trait BlockCache: Send + Sync {
    /// Non-blocking probe: the block if it is cached and not locked elsewhere.
    fn try_lock(&self, key: BlockKey) -> Option<LockedBlock>;

    /// Non-blocking acquisition: the cached block, or a new empty one when
    /// absent. `Ok(None)` when another thread holds the block.
    fn try_lock_or_create(&self, key: BlockKey, size: usize) -> Result<Option<LockedBlock>>;

    /// Blocking acquisition: waits for other holders, creates an empty block
    /// of `size` bytes when absent.
    fn lock_or_create(&self, key: BlockKey, size: usize) -> Result<LockedBlock>;

    /// Total number of bytes the cache is allowed to hold.
    fn budget(&self) -> usize;
}

/// Least-recently-used [`BlockCache`] bounded by a byte budget.
pub struct LruBlockCache {
    budget: Arc<AtomicUsize>,
    state: Arc<Mutex<CacheState>>,
}

impl LruBlockCache {
    pub fn new(budget: usize) -> Self {
        LruBlockCache {
            budget: Arc::new(AtomicUsize::new(budget)),
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                used: 0,
            })),
        }
    }

    pub fn set_budget(&self, budget: usize) {
        self.budget.store(budget, Ordering::Relaxed);
        self.state.lock().make_room(0, budget);
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    fn check_size(&self, key: BlockKey, size: usize) -> Result<()> {
        if size > self.budget() {
            return Err(Jp2Error::BlockAllocation { key, size });
        }
        Ok(())
    }

    fn locked(&self, key: BlockKey, guard: ArcMutexGuard<RawMutex, BlockData>) -> LockedBlock {
        LockedBlock {
            key,
            guard,
            state: self.state.clone(),
            budget: self.budget.clone(),
        }
    }
}

impl BlockCache for LruBlockCache {
    fn try_lock(&self, key: BlockKey) -> Option<LockedBlock> {
        let block = self.state.lock().entries.get(&key)?.block.clone();
        let guard = block.try_lock_arc()?;
        Some(self.locked(key, guard))
    }

    fn try_lock_or_create(&self, key: BlockKey, size: usize) -> Result<Option<LockedBlock>> {
        self.check_size(key, size)?;
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(&key) {
            let block = entry.block.clone();
            drop(state);
            return Ok(block.try_lock_arc().map(|guard| self.locked(key, guard)));
        }
        let guard = state.insert_locked(key, size, self.budget());
        drop(state);
        Ok(Some(self.locked(key, guard)))
    }

    fn lock_or_create(&self, key: BlockKey, size: usize) -> Result<LockedBlock> {
        self.check_size(key, size)?;
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(&key) {
            let block = entry.block.clone();
            drop(state);
            let guard = block.lock_arc();
            return Ok(self.locked(key, guard));
        }
        let guard = state.insert_locked(key, size, self.budget());
        drop(state);
        Ok(self.locked(key, guard))
    }

    fn budget(&self) -> usize {
        self.budget.load(Ordering::Relaxed)
    }
}

static GLOBAL_CACHE: Lazy<Arc<LruBlockCache>> =
    Lazy::new(|| Arc::new(LruBlockCache::new(config::cache_max())));

/// The process-wide cache, sized from `GDAL_CACHEMAX` on first use.
pub fn global_block_cache() -> Arc<LruBlockCache> {
    GLOBAL_CACHE.clone()
}
