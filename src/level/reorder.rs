//! Reorder Buffer
//!
//! Per-slot table of in-flight operations for one region. It decides, for
//! every new read or write, whether the operation can be answered from
//! work already in flight:
//!
//! - read after read: join the outstanding read's promise
//! - read after pending write: resolve immediately with the bytes being written
//! - write after write: chain behind the previous write and mark it superseded
//! - write after read: always installs a new current version
//!
//! Every plan handed out holds one reference on its slot's entry; the
//! reference is dropped when the plan's promise completes, and the entry
//! disappears with its last reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::concurrency::Promise;

struct ReorderEntry {
    /// Pending read, or the value of the latest submitted write
    version: Promise<Option<Bytes>>,
    /// Completion of the latest submitted write
    write: Option<Promise<()>>,
    /// Raised on the latest write once a newer one arrives
    superseded: Option<Arc<AtomicBool>>,
    refs: usize,
}

/// What a read should do
pub enum ReadPlan {
    /// Another operation already determines the value; wait on it
    Join(Promise<Option<Bytes>>),
    /// Nothing in flight; perform the read and complete this promise
    Issue(Promise<Option<Bytes>>),
}

impl ReadPlan {
    pub fn promise(&self) -> &Promise<Option<Bytes>> {
        match self {
            ReadPlan::Join(promise) | ReadPlan::Issue(promise) => promise,
        }
    }
}

/// What a write should do
pub struct WritePlan {
    /// Complete once the write is applied (or skipped)
    pub done: Promise<()>,
    /// Write of the same slot that must finish first
    pub previous: Option<Promise<()>>,
    /// Set when a newer write to the same slot arrives
    pub superseded: Arc<AtomicBool>,
}

impl WritePlan {
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }
}

/// Coalescing table keyed by header slot
#[derive(Default)]
pub struct ReorderBuffer {
    entries: Mutex<HashMap<u16, ReorderEntry>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a read of `index`
    pub fn begin_read(self: &Arc<Self>, index: u16) -> ReadPlan {
        let plan = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&index) {
                Some(entry) => {
                    entry.refs += 1;
                    ReadPlan::Join(entry.version.clone())
                }
                None => {
                    let version = Promise::new();
                    entries.insert(
                        index,
                        ReorderEntry {
                            version: version.clone(),
                            write: None,
                            superseded: None,
                            refs: 1,
                        },
                    );
                    ReadPlan::Issue(version)
                }
            }
        };
        // May run the release right away, so the table lock must be free
        self.release_on_complete(index, plan.promise());
        plan
    }

    /// Plan a write of `value` to `index` (`None` deletes)
    pub fn begin_write(self: &Arc<Self>, index: u16, value: Option<Bytes>) -> WritePlan {
        let done = Promise::new();
        let superseded = Arc::new(AtomicBool::new(false));
        let previous = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(index).or_insert_with(|| ReorderEntry {
                version: Promise::new(),
                write: None,
                superseded: None,
                refs: 0,
            });
            entry.refs += 1;
            entry.version = Promise::resolved(Ok(value));
            if let Some(older) = entry.superseded.replace(Arc::clone(&superseded)) {
                older.store(true, Ordering::Release);
            }
            entry.write.replace(done.clone())
        };
        self.release_on_complete(index, &done);
        WritePlan {
            done,
            previous,
            superseded,
        }
    }

    /// Drop one reference on `index`, removing the entry with the last one
    pub fn release(&self, index: u16) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&index) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&index);
            }
        }
    }

    /// Slots with an in-flight operation
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// References currently held on `index`
    pub fn refs(&self, index: u16) -> usize {
        self.entries.lock().get(&index).map_or(0, |entry| entry.refs)
    }

    fn release_on_complete<T>(self: &Arc<Self>, index: u16, promise: &Promise<T>)
    where
        T: Clone + Send + 'static,
    {
        let buffer = Arc::clone(self);
        promise.on_complete(move |_| buffer.release(index));
    }
}
