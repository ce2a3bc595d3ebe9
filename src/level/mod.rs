//! Level Module
//!
//! The top-level storage engine: maps chunk positions to region files,
//! keeps a bounded LRU cache of open regions, and coalesces overlapping
//! operations on the same chunk.
//!
//! ## Concurrency Model
//!
//! - **Cache**: one lock guards the LRU map; it is held only to look up,
//!   insert or evict an entry, never across file I/O
//! - **Regions**: open in the background on the worker pool; operations
//!   queued before the open finishes run as soon as it does
//! - **Chunks**: per-slot reorder buffers answer reads from in-flight work
//!   and chain writes of the same slot in submission order
//! - **Eviction**: the least recently used region is closed on the serial
//!   lane after its in-flight operations finish; reopening the same region
//!   waits for that close

mod region;
mod reorder;

pub use reorder::{ReadPlan, ReorderBuffer, WritePlan};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::concurrency::{Promise, WorkerPool};
use crate::config::Config;
use crate::error::{AnvilError, ErrorAggregator, Result};
use crate::pos::ChunkPos;
use crate::region::{region_file_name, OversizeStorage};
use crate::report::Reporter;

use region::{Context, InflightGuard, Region, Stats};

// =============================================================================
// Tickets
// =============================================================================

/// Handle to the result of a submitted operation
#[must_use = "a ticket does nothing unless waited on"]
pub struct Ticket<T> {
    promise: Promise<T>,
}

impl<T: Clone + Send + 'static> Ticket<T> {
    fn new(promise: Promise<T>) -> Self {
        Self { promise }
    }

    /// Block until the operation has finished
    pub fn wait(self) -> Result<T> {
        self.promise.wait()
    }

    /// Whether the result is already available
    pub fn is_ready(&self) -> bool {
        self.promise.is_complete()
    }

    /// The result, if already available
    pub fn try_get(&self) -> Option<Result<T>> {
        self.promise.try_get()
    }
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelStats {
    /// Reads that went to a region file
    pub storage_reads: u64,
    /// Writes and deletes applied to a region file
    pub storage_writes: u64,
    /// Reads answered by an operation already in flight
    pub coalesced_reads: u64,
    /// Writes superseded before they reached storage
    pub skipped_writes: u64,
    /// Region files opened
    pub region_opens: u64,
    /// Region files evicted from the cache
    pub region_evictions: u64,
    /// Region files currently cached
    pub open_regions: usize,
}

/// Byte-oriented chunk store
pub trait ChunkStore: Send + Sync {
    fn get(&self, pos: ChunkPos) -> Result<Option<Bytes>>;

    fn set(&self, pos: ChunkPos, bytes: Bytes) -> Result<()>;
}

// =============================================================================
// Level Storage
// =============================================================================

struct RegionCache {
    open: LruCache<u64, Arc<Region>>,
    /// Evicted regions whose files are still closing
    closing: HashMap<u64, Promise<()>>,
    closed: bool,
}

struct LevelShared {
    data_dir: PathBuf,
    capacity: usize,
    ctx: Arc<Context>,
    cache: Mutex<RegionCache>,
}

/// Chunk storage over a directory of region files
pub struct LevelStorage {
    config: Config,
    shared: Arc<LevelShared>,
    workers: WorkerPool,
    lane: WorkerPool,
}

impl LevelStorage {
    /// Open or create a level in `config.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let workers = WorkerPool::new("anvil-worker", config.worker_threads)?;
        let lane = WorkerPool::new("anvil-lane", 1)?;

        let ctx = Arc::new(Context {
            workers: workers.handle(),
            lane: lane.handle(),
            reporter: Reporter::new(Arc::clone(&config.error_sink)),
            oversize: Arc::new(OversizeStorage::new(&config.data_dir)),
            compression: config.compression,
            threshold_sectors: config.oversize_threshold_sectors,
            queue_depth_warning: config.queue_depth_warning,
            stats: Stats::default(),
        });

        let shared = Arc::new(LevelShared {
            data_dir: config.data_dir.clone(),
            capacity: config.region_cache_capacity,
            ctx,
            cache: Mutex::new(RegionCache {
                open: LruCache::unbounded(),
                closing: HashMap::new(),
                closed: false,
            }),
        });

        tracing::info!(
            data_dir = %config.data_dir.display(),
            compression = %config.compression,
            workers = config.worker_threads,
            "level storage opened"
        );

        Ok(Self {
            config,
            shared,
            workers,
            lane,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Start reading the chunk at `pos`
    pub fn submit_get(&self, pos: ChunkPos) -> Result<Ticket<Option<Bytes>>> {
        let (region, guard) = self.locate(pos)?;
        Ok(region.get(pos, guard))
    }

    /// Start writing `bytes` to the chunk at `pos`
    pub fn submit_set(&self, pos: ChunkPos, bytes: impl Into<Bytes>) -> Result<Ticket<()>> {
        let (region, guard) = self.locate(pos)?;
        Ok(region.put(pos, Some(bytes.into()), guard))
    }

    /// Start deleting the chunk at `pos`
    pub fn submit_delete(&self, pos: ChunkPos) -> Result<Ticket<()>> {
        let (region, guard) = self.locate(pos)?;
        Ok(region.put(pos, None, guard))
    }

    /// Read the chunk at `pos`
    pub fn get(&self, pos: ChunkPos) -> Result<Option<Bytes>> {
        self.submit_get(pos)?.wait()
    }

    /// Write `bytes` to the chunk at `pos`
    pub fn set(&self, pos: ChunkPos, bytes: impl Into<Bytes>) -> Result<()> {
        self.submit_set(pos, bytes)?.wait()
    }

    /// Delete the chunk at `pos`
    pub fn delete(&self, pos: ChunkPos) -> Result<()> {
        self.submit_delete(pos)?.wait()
    }

    /// Close every cached region and stop the worker threads
    ///
    /// All regions are closed even if some fail; the failures are returned
    /// together.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> LevelStats {
        let stats = &self.shared.ctx.stats;
        LevelStats {
            storage_reads: stats.storage_reads.load(Ordering::Relaxed),
            storage_writes: stats.storage_writes.load(Ordering::Relaxed),
            coalesced_reads: stats.coalesced_reads.load(Ordering::Relaxed),
            skipped_writes: stats.skipped_writes.load(Ordering::Relaxed),
            region_opens: stats.region_opens.load(Ordering::Relaxed),
            region_evictions: stats.region_evictions.load(Ordering::Relaxed),
            open_regions: self.shared.cache.lock().open.len(),
        }
    }

    /// Whether the region containing `pos` is in the cache
    pub fn is_region_cached(&self, pos: ChunkPos) -> bool {
        self.shared.cache.lock().open.contains(&pos.region_key())
    }

    /// Cached region keys, most recently used first
    pub fn cached_regions(&self) -> Vec<u64> {
        self.shared.cache.lock().open.iter().map(|(key, _)| *key).collect()
    }

    /// Chunk slots with an operation in flight, across all cached regions
    pub fn pending_operations(&self) -> usize {
        let regions: Vec<Arc<Region>> = self
            .shared
            .cache
            .lock()
            .open
            .iter()
            .map(|(_, region)| Arc::clone(region))
            .collect();
        regions.iter().map(|region| region.pending_slots()).sum()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Find or open the region holding `pos` and register an operation on it
    fn locate(&self, pos: ChunkPos) -> Result<(Arc<Region>, InflightGuard)> {
        let key = pos.region_key();
        let mut cache = self.shared.cache.lock();
        if cache.closed {
            return Err(AnvilError::Closed);
        }

        if let Some(region) = cache.open.get(&key) {
            let region = Arc::clone(region);
            let guard = region.enter();
            return Ok((region, guard));
        }

        if cache.open.len() >= self.shared.capacity {
            if let Some((old_key, old)) = cache.open.pop_lru() {
                self.evict(&mut cache, old_key, old);
            }
        }

        let path = self
            .shared
            .data_dir
            .join(region_file_name(pos.region_x(), pos.region_z()));
        let stall = cache.closing.get(&key).cloned();
        let region = Region::open(key, path, Arc::clone(&self.shared.ctx), stall);
        Stats::bump(&self.shared.ctx.stats.region_opens);

        cache.open.put(key, Arc::clone(&region));
        let guard = region.enter();
        Ok((region, guard))
    }

    fn evict(&self, cache: &mut RegionCache, key: u64, region: Arc<Region>) {
        tracing::debug!(key, "evicting region");
        Stats::bump(&self.shared.ctx.stats.region_evictions);

        let done = Promise::new();
        let shared: Weak<LevelShared> = Arc::downgrade(&self.shared);
        let marker = done.clone();
        done.on_complete(move |result| {
            if let Err(err) = result {
                tracing::error!(key, error = %err, "evicted region failed to close");
            }
            if let Some(shared) = shared.upgrade() {
                let mut cache = shared.cache.lock();
                if cache.closing.get(&key).is_some_and(|p| p.ptr_eq(&marker)) {
                    cache.closing.remove(&key);
                }
            }
        });

        cache.closing.insert(key, done.clone());
        region.retire(done);
    }

    fn shutdown(&self) -> Result<()> {
        let (regions, closing) = {
            let mut cache = self.shared.cache.lock();
            if cache.closed {
                return Ok(());
            }
            cache.closed = true;
            let mut regions = Vec::with_capacity(cache.open.len());
            while let Some((_, region)) = cache.open.pop_lru() {
                regions.push(region);
            }
            let closing: Vec<Promise<()>> = cache.closing.values().cloned().collect();
            (regions, closing)
        };

        let pending: Vec<Promise<()>> = regions
            .into_iter()
            .map(|region| {
                let done = Promise::new();
                region.retire(done.clone());
                done
            })
            .collect();

        let mut errors = ErrorAggregator::new();
        for done in pending {
            errors.capture(|| done.wait());
        }
        // Already logged by the eviction that started them
        for done in closing {
            let _ = done.wait();
        }

        self.lane.shutdown();
        self.workers.shutdown();
        tracing::info!(data_dir = %self.shared.data_dir.display(), "level storage closed");
        errors.finish()
    }
}

impl ChunkStore for LevelStorage {
    fn get(&self, pos: ChunkPos) -> Result<Option<Bytes>> {
        LevelStorage::get(self, pos)
    }

    fn set(&self, pos: ChunkPos, bytes: Bytes) -> Result<()> {
        LevelStorage::set(self, pos, bytes)
    }
}

impl Drop for LevelStorage {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "level storage failed to close cleanly");
        }
    }
}
