//! Parallel warm-up of the block cache.
//!
//! A [`PrefetchJob`] lists the blocks of a window that are not cached yet.
//! Workers claim entries through a shared cursor, so every block is decoded
//! by exactly one of them. Each worker reads through its own handle on the
//! dataset resource.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tracing::debug;

use crate::block_cache::{BlockCache, BlockKey, LockedBlock};
use crate::errors::Result;
use crate::raster::{BandSubset, TileCoordinate};
use crate::vsi::{self, VsiFile};

/// What a prefetch worker needs from the dataset it warms up.
pub(crate) trait PrefetchTarget: Sync {
    /// Name the workers open their own handle with.
    fn resource_name(&self) -> &str;

    fn cache(&self) -> &dyn BlockCache;

    fn block_key(&self, band: usize, tile: TileCoordinate) -> BlockKey;

    fn block_bytes(&self) -> usize;

    /// Decode `tile` into the locked `block` of `band` and into the sibling
    /// blocks of `bands`, marking them filled.
    fn fill_block(
        &self,
        file: &mut VsiFile,
        band: usize,
        tile: TileCoordinate,
        block: &mut LockedBlock,
        bands: &BandSubset,
    ) -> Result<()>;
}

/// Blocks of one band waiting to be decoded.
#[derive(Debug)]
pub struct PrefetchJob {
    band: usize,
    bands: BandSubset,
    tiles: Vec<TileCoordinate>,
    cursor: AtomicUsize,
}

impl PrefetchJob {
    pub fn new(band: usize, bands: BandSubset, tiles: Vec<TileCoordinate>) -> Self {
        PrefetchJob {
            band,
            bands,
            tiles,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tiles(&self) -> &[TileCoordinate] {
        &self.tiles
    }

    /// Hand out the next unclaimed tile, `None` once all were claimed.
    pub fn claim(&self) -> Option<TileCoordinate> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.tiles.get(index).copied()
    }
}

/// Outcome of a prefetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preload {
    /// Whether reads may fill sibling band blocks.
    pub other_bands_safe: bool,
    /// Number of blocks handed to workers.
    pub queued: usize,
    /// Number of worker threads started.
    pub workers: usize,
}

/// Keep the tiles of `band` that are not in the cache.
///
/// Cached blocks are probed without waiting and released right away.
pub(crate) fn uncached_tiles(
    target: &dyn PrefetchTarget,
    band: usize,
    tiles: impl IntoIterator<Item = TileCoordinate>,
) -> Vec<TileCoordinate> {
    tiles
        .into_iter()
        .filter(|&tile| {
            target
                .cache()
                .try_lock(target.block_key(band, tile))
                .is_none()
        })
        .collect()
}

/// Decode the blocks of `job` with up to `max_workers` threads.
///
/// Returns the number of workers started. Returns once every worker
/// finished.
pub(crate) fn run(target: &dyn PrefetchTarget, job: &PrefetchJob, max_workers: usize) -> usize {
    let workers = job.len().min(max_workers);
    debug!(target: "openjpeg", "{} blocks to load with {} workers", job.len(), workers);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker(target, job));
        }
    });
    workers
}

fn worker(target: &dyn PrefetchTarget, job: &PrefetchJob) {
    let name = target.resource_name();
    let mut file = match vsi::open(name) {
        Ok(file) => file,
        Err(e) => {
            debug!(target: "openjpeg", "Cannot open {}: {}", name, e);
            return;
        }
    };

    while let Some(tile) = job.claim() {
        let key = target.block_key(job.band, tile);
        let mut block = match target.cache().lock_or_create(key, target.block_bytes()) {
            Ok(block) => block,
            Err(e) => {
                debug!(target: "openjpeg", "stopping prefetch worker: {}", e);
                break;
            }
        };
        if block.is_filled() {
            continue;
        }
        if let Err(e) = target.fill_block(&mut file, job.band, tile, &mut block, &job.bands) {
            debug!(target: "openjpeg", ?tile, "prefetch of block failed: {}", e);
        }
    }
}
