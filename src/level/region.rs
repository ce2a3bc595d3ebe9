//! Cached Region
//!
//! One entry of the level's region cache: a region file that opens in the
//! background, its reorder buffer, and the bookkeeping that delays closing
//! an evicted region until its last in-flight operation has finished.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::concurrency::{PoolHandle, Promise};
use crate::error::{Result, Warning};
use crate::pos::ChunkPos;
use crate::region::{Compression, OversizeStorage, RegionStorage, SectorFile};
use crate::report::Reporter;

use super::reorder::{ReadPlan, ReorderBuffer, WritePlan};
use super::Ticket;

// =============================================================================
// Shared Execution Context
// =============================================================================

/// Everything a region needs to run operations, shared by all regions
pub(crate) struct Context {
    pub(crate) workers: PoolHandle,
    pub(crate) lane: PoolHandle,
    pub(crate) reporter: Reporter,
    pub(crate) oversize: Arc<OversizeStorage>,
    pub(crate) compression: Compression,
    pub(crate) threshold_sectors: u32,
    pub(crate) queue_depth_warning: usize,
    pub(crate) stats: Stats,
}

impl Context {
    /// Queue a job on the worker pool, warning when the queue runs deep
    fn spawn<F>(&self, pos: ChunkPos, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let depth = self.workers.execute(job);
        if depth == self.queue_depth_warning + 1 {
            self.reporter.warn(Warning::QueueDepth, pos, &[depth as i64]);
        }
    }
}

/// Engine-wide counters
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) storage_reads: AtomicU64,
    pub(crate) storage_writes: AtomicU64,
    pub(crate) coalesced_reads: AtomicU64,
    pub(crate) skipped_writes: AtomicU64,
    pub(crate) region_opens: AtomicU64,
    pub(crate) region_evictions: AtomicU64,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Region
// =============================================================================

#[derive(Default)]
struct Activity {
    /// Operations that located this region and have not finished
    inflight: usize,
    /// Set on eviction; completed once the file is closed
    retire: Option<Promise<()>>,
}

pub(crate) struct Region {
    key: u64,
    path: PathBuf,
    storage: Promise<Arc<RegionStorage>>,
    reorder: Arc<ReorderBuffer>,
    activity: Mutex<Activity>,
    ctx: Arc<Context>,
}

impl Region {
    /// Create the cache entry and queue the file open
    ///
    /// If the same region is still closing from an earlier eviction, the
    /// open waits for `stall` first.
    pub(crate) fn open(
        key: u64,
        path: PathBuf,
        ctx: Arc<Context>,
        stall: Option<Promise<()>>,
    ) -> Arc<Self> {
        let region = Arc::new(Self {
            key,
            path,
            storage: Promise::new(),
            reorder: Arc::new(ReorderBuffer::new()),
            activity: Mutex::new(Activity::default()),
            ctx,
        });

        let job = {
            let region = Arc::clone(&region);
            move || region.load()
        };
        match stall {
            Some(stall) => {
                let workers = region.ctx.workers.clone();
                stall.on_complete(move |_| {
                    workers.execute(job);
                });
            }
            None => {
                region.ctx.workers.execute(job);
            }
        }
        region
    }

    fn load(&self) {
        let ctx = &self.ctx;
        let result = SectorFile::open(&self.path, ctx.lane.clone(), ctx.reporter.clone())
            .map(|file| file.with_backlog_warning(ctx.queue_depth_warning))
            .map(|file| {
                Arc::new(RegionStorage::new(
                    file,
                    Arc::clone(&ctx.oversize),
                    ctx.compression,
                    ctx.threshold_sectors,
                    ctx.reporter.clone(),
                ))
            });
        match &result {
            Ok(_) => tracing::debug!(path = %self.path.display(), "region opened"),
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "region open failed")
            }
        }
        self.storage.complete(result);
    }

    /// Slots of this region with an operation in flight
    pub(crate) fn pending_slots(&self) -> usize {
        self.reorder.len()
    }

    /// Register an operation; the region stays open until the guard drops
    pub(crate) fn enter(self: &Arc<Self>) -> InflightGuard {
        self.activity.lock().inflight += 1;
        InflightGuard {
            region: Arc::clone(self),
        }
    }

    /// Close the file once no operation is in flight, then complete `done`
    pub(crate) fn retire(self: &Arc<Self>, done: Promise<()>) {
        let ready = {
            let mut activity = self.activity.lock();
            if activity.inflight == 0 {
                Some(done)
            } else {
                activity.retire = Some(done);
                None
            }
        };
        if let Some(done) = ready {
            self.close_on_lane(done);
        }
    }

    fn leave(self: &Arc<Self>) {
        let retire = {
            let mut activity = self.activity.lock();
            activity.inflight -= 1;
            if activity.inflight == 0 {
                activity.retire.take()
            } else {
                None
            }
        };
        if let Some(done) = retire {
            self.close_on_lane(done);
        }
    }

    fn close_on_lane(self: &Arc<Self>, done: Promise<()>) {
        let lane = self.ctx.lane.clone();
        let path = self.path.clone();
        let key = self.key;
        self.storage.on_complete(move |storage| {
            let storage = storage.clone();
            lane.execute(move || {
                // A region that never opened has nothing to close
                let result = match storage {
                    Ok(storage) => storage.close(),
                    Err(_) => Ok(()),
                };
                match &result {
                    Ok(()) => tracing::debug!(path = %path.display(), key, "region closed"),
                    Err(err) => {
                        tracing::error!(path = %path.display(), error = %err, "region close failed")
                    }
                }
                done.complete(result);
            });
        });
    }

    /// Run `f` on the worker pool once the file is open
    fn with_storage<F>(&self, pos: ChunkPos, f: F)
    where
        F: FnOnce(Result<Arc<RegionStorage>>) + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        self.storage.on_complete(move |storage| {
            let storage = storage.clone();
            ctx.spawn(pos, move || f(storage));
        });
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub(crate) fn get(
        self: &Arc<Self>,
        pos: ChunkPos,
        guard: InflightGuard,
    ) -> Ticket<Option<Bytes>> {
        match self.reorder.begin_read(pos.local_index()) {
            ReadPlan::Join(version) => {
                Stats::bump(&self.ctx.stats.coalesced_reads);
                drop(guard);
                Ticket::new(version)
            }
            ReadPlan::Issue(version) => {
                let ctx = Arc::clone(&self.ctx);
                let result = version.clone();
                self.with_storage(pos, move |storage| {
                    Stats::bump(&ctx.stats.storage_reads);
                    let value = storage
                        .and_then(|storage| storage.read(pos))
                        .map(|raw| raw.map(Bytes::from));
                    if let Err(err) = &value {
                        tracing::debug!(%pos, error = %err, "chunk read failed");
                    }
                    result.complete(value);
                    drop(guard);
                });
                Ticket::new(version)
            }
        }
    }

    /// Write `value` to `pos`, or delete the chunk when `value` is `None`
    pub(crate) fn put(
        self: &Arc<Self>,
        pos: ChunkPos,
        value: Option<Bytes>,
        guard: InflightGuard,
    ) -> Ticket<()> {
        let WritePlan {
            done,
            previous,
            superseded,
        } = self.reorder.begin_write(pos.local_index(), value.clone());
        let ticket = Ticket::new(done.clone());

        let region = Arc::clone(self);
        let ctx = Arc::clone(&self.ctx);
        self.ctx.spawn(pos, move || {
            // Compress before waiting on the previous write of this slot
            let encoded = match &value {
                Some(bytes) => ctx.compression.wrap(bytes).map(Some),
                None => Ok(None),
            };

            let apply = move || {
                region.with_storage(pos, move |storage| {
                    let result = if superseded.load(Ordering::Acquire) {
                        Stats::bump(&ctx.stats.skipped_writes);
                        Ok(())
                    } else {
                        Stats::bump(&ctx.stats.storage_writes);
                        encoded.and_then(|encoded| {
                            let storage = storage?;
                            match encoded {
                                Some(encoded) => storage.write_encoded(pos, &encoded),
                                None => storage.remove(pos),
                            }
                        })
                    };
                    if let Err(err) = &result {
                        tracing::debug!(%pos, error = %err, "chunk write failed");
                    }
                    done.complete(result);
                    drop(guard);
                });
            };

            match previous {
                Some(previous) => previous.on_complete(move |_| apply()),
                None => apply(),
            }
        });
        ticket
    }
}

/// Keeps a region open while an operation is in flight
pub(crate) struct InflightGuard {
    region: Arc<Region>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.region.leave();
    }
}
