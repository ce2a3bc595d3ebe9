//! Sector File
//!
//! Owns one region file: the 8 KiB header, the sector bitmap, and the
//! reference-counted allocation table.
//!
//! ## Allocation Lifecycle
//! A write never reuses its slot's old range. It claims a fresh range,
//! writes the frame there, then swaps the slot's allocation word. The old
//! range is freed on the spot unless a reader that started under the old
//! word is still copying it out; in that case the range is marked
//! pending-free and released by the last such reader.
//!
//! ## Header Persistence
//! Every swap bumps an in-memory generation. The header flush for that
//! generation runs later on the serial lane and is skipped if a newer
//! generation already reached disk, so the durable header never regresses.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use crate::concurrency::PoolHandle;
use crate::error::{AnvilError, ErrorAggregator, Result, Warning};
use crate::pos::{ChunkPos, REGION_CHUNKS};
use crate::report::Reporter;

use super::bitmap::SectorBitmap;
use super::{HEADER_BYTES, HEADER_SECTORS, MAX_ENTRY_SECTORS, SECTOR_BYTES};

/// Highest start sector an allocation word can address (24 bits)
const MAX_START_SECTOR: usize = (1 << 24) - 1;

// =============================================================================
// Allocation Words
// =============================================================================

/// Packed `(start_sector << 8) | sector_count`; zero means unallocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocationWord(u32);

impl AllocationWord {
    pub const EMPTY: AllocationWord = AllocationWord(0);

    pub fn new(start: u32, count: u8) -> Self {
        Self((start << 8) | count as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn start(self) -> usize {
        (self.0 >> 8) as usize
    }

    pub fn count(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn byte_offset(self) -> u64 {
        self.start() as u64 * SECTOR_BYTES as u64
    }

    pub fn byte_len(self) -> usize {
        self.count() * SECTOR_BYTES
    }
}

/// Sectors needed to hold `len` bytes (at least one)
pub fn sectors_for(len: usize) -> usize {
    len.div_ceil(SECTOR_BYTES).max(1)
}

/// Occupancy summary of one region file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectorStats {
    /// Slots with a non-zero allocation word
    pub entries: usize,
    /// Sum of sector counts over all allocated slots
    pub allocated_sectors: usize,
    /// Sectors marked used in the bitmap, header included
    pub used_sectors: usize,
    /// Sectors of swapped-out words still held by readers
    pub pending_free_sectors: usize,
    /// Current file length in bytes
    pub file_len: u64,
}

// =============================================================================
// Allocation Table
// =============================================================================

#[derive(Debug, Default)]
struct Lease {
    readers: u32,
    pending_free: bool,
}

/// Header contents plus everything guarded with it
struct Table {
    allocs: Vec<AllocationWord>,
    timestamps: Vec<u32>,
    leases: HashMap<AllocationWord, Lease>,
    bitmap: SectorBitmap,
    /// Generation of the in-memory header
    version: u64,
}

impl Table {
    fn new() -> Self {
        let mut bitmap = SectorBitmap::new();
        bitmap.force(0, HEADER_SECTORS);
        Self {
            allocs: vec![AllocationWord::EMPTY; REGION_CHUNKS],
            timestamps: vec![0; REGION_CHUNKS],
            leases: HashMap::new(),
            bitmap,
            version: 0,
        }
    }

    /// Load a header image and replay its allocations into the bitmap
    fn load(&mut self, header: &[u8]) -> std::result::Result<(), (u16, u32)> {
        for index in 0..REGION_CHUNKS {
            let at = index * 4;
            let raw =
                u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
            let ts_at = SECTOR_BYTES + at;
            self.timestamps[index] = u32::from_be_bytes([
                header[ts_at],
                header[ts_at + 1],
                header[ts_at + 2],
                header[ts_at + 3],
            ]);

            let word = AllocationWord::from_raw(raw);
            if word.is_empty() {
                continue;
            }
            if word.start() < HEADER_SECTORS
                || word.count() == 0
                || self.bitmap.any_used(word.start(), word.count())
            {
                return Err((index as u16, raw));
            }
            self.bitmap.force(word.start(), word.count());
            self.allocs[index] = word;
        }
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_BYTES);
        for word in &self.allocs {
            header.extend_from_slice(&word.raw().to_be_bytes());
        }
        for timestamp in &self.timestamps {
            header.extend_from_slice(&timestamp.to_be_bytes());
        }
        header
    }

    /// Take a reader reference on the slot's current word
    fn acquire(&mut self, index: usize) -> Option<AllocationWord> {
        let word = self.allocs[index];
        if word.is_empty() {
            return None;
        }
        self.leases.entry(word).or_default().readers += 1;
        Some(word)
    }

    /// Drop a reader reference, performing a deferred free if it was the last
    fn release(&mut self, word: AllocationWord) {
        if let Entry::Occupied(mut entry) = self.leases.entry(word) {
            entry.get_mut().readers -= 1;
            if entry.get().readers == 0 && entry.remove().pending_free {
                self.bitmap.free(word.start(), word.count());
            }
        }
    }

    /// Install `word` for the slot and retire the previous one
    fn swap(&mut self, index: usize, word: AllocationWord) -> u64 {
        let old = std::mem::replace(&mut self.allocs[index], word);
        if !old.is_empty() {
            match self.leases.get_mut(&old) {
                Some(lease) => lease.pending_free = true,
                None => self.bitmap.free(old.start(), old.count()),
            }
        }
        self.timestamps[index] = unix_seconds();
        self.version += 1;
        self.version
    }
}

// =============================================================================
// Sector File
// =============================================================================

struct Shared {
    path: PathBuf,
    /// `None` once closed
    file: RwLock<Option<File>>,
    table: Mutex<Table>,
    /// Generation of the header last written to disk. Held for the whole
    /// snapshot-and-write so header writes for this file never interleave.
    durable: Mutex<u64>,
    reporter: Reporter,
}

/// One open region file
pub struct SectorFile {
    shared: Arc<Shared>,
    header_lane: PoolHandle,
    /// Header lane depth past which a backend bottleneck is reported
    backlog_warning: Option<usize>,
}

impl SectorFile {
    /// Open or create the region file at `path`
    ///
    /// Header flushes are queued on `header_lane`, which must run jobs one
    /// at a time.
    pub fn open(
        path: impl AsRef<Path>,
        header_lane: PoolHandle,
        reporter: Reporter,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| reporter.io(e, ChunkPos::ZERO))?;

        let mut header = vec![0u8; HEADER_BYTES];
        let len = read_up_to(&file, &mut header, 0)?;

        let mut table = Table::new();
        if len == 0 {
            write_all_at(&file, &header, 0).map_err(|e| reporter.io(e, ChunkPos::ZERO))?;
        } else if len < HEADER_BYTES {
            return Err(reporter.raise(
                AnvilError::CorruptHeader { path, len },
                ChunkPos::ZERO,
                &[len as i64],
            ));
        } else if let Err((index, word)) = table.load(&header) {
            return Err(reporter.raise(
                AnvilError::MalformedIndex { index, word },
                ChunkPos::ZERO,
                &[index as i64, word as i64],
            ));
        }

        tracing::debug!(path = %path.display(), fresh = len == 0, "sector file opened");

        Ok(Self {
            shared: Arc::new(Shared {
                path,
                file: RwLock::new(Some(file)),
                table: Mutex::new(table),
                durable: Mutex::new(0),
                reporter,
            }),
            header_lane,
            backlog_warning: None,
        })
    }

    /// Report `STORAGE_BACKEND` when queued header flushes exceed `limit`
    pub fn with_backlog_warning(mut self, limit: usize) -> Self {
        self.backlog_warning = Some(limit);
        self
    }

    /// Read the raw frame stored in slot `index`
    ///
    /// Returns `None` for an unallocated slot. The returned buffer is the
    /// whole allocated range, or less if the file ends early.
    pub fn read_object(&self, index: u16) -> Result<Option<Vec<u8>>> {
        let word = match self.shared.table.lock().acquire(index as usize) {
            Some(word) => word,
            None => return Ok(None),
        };
        let _lease = ReadLease {
            table: &self.shared.table,
            word,
        };

        let mut buf = vec![0u8; word.byte_len()];
        let read = {
            let file = self.shared.file()?;
            read_up_to(&file, &mut buf, word.byte_offset())?
        };
        if read == 0 {
            return Err(self.shared.reporter.raise(
                AnvilError::TruncatedFile { index },
                ChunkPos::ZERO,
                &[index as i64],
            ));
        }
        buf.truncate(read);
        tracing::trace!(index, start = word.start(), sectors = word.count(), "object read");
        Ok(Some(buf))
    }

    /// Store `frame` in slot `index`
    ///
    /// Returns the header generation of this write; its header flush has
    /// already been queued.
    pub fn write_object(&self, index: u16, frame: &[u8]) -> Result<u64> {
        let count = sectors_for(frame.len());
        if count > MAX_ENTRY_SECTORS {
            return Err(AnvilError::FrameTooLarge { len: frame.len() });
        }

        let start = self.shared.table.lock().bitmap.allocate(count);
        if start > MAX_START_SECTOR {
            self.shared.table.lock().bitmap.free(start, count);
            return Err(self.shared.reporter.raise(
                AnvilError::StorageSpace(Arc::new(io::Error::new(
                    io::ErrorKind::Other,
                    "region file exceeds addressable sectors",
                ))),
                ChunkPos::ZERO,
                &[index as i64, start as i64],
            ));
        }

        let word = AllocationWord::new(start as u32, count as u8);
        if let Err(err) = self.shared.write_at(frame, word.byte_offset()) {
            self.shared.table.lock().bitmap.free(start, count);
            return Err(err);
        }

        let generation = self.shared.table.lock().swap(index as usize, word);
        self.schedule_header_flush(generation);
        tracing::trace!(index, start, sectors = count, generation, "object written");
        Ok(generation)
    }

    /// Unallocate slot `index`; returns the header generation
    pub fn delete_object(&self, index: u16) -> Result<u64> {
        let generation = {
            let mut table = self.shared.table.lock();
            if table.allocs[index as usize].is_empty() {
                return Ok(table.version);
            }
            table.swap(index as usize, AllocationWord::EMPTY)
        };
        self.schedule_header_flush(generation);
        Ok(generation)
    }

    /// Write the header if generation `generation` is not yet on disk
    ///
    /// Returns whether a write happened. A flush for an older generation
    /// than what is already durable is skipped.
    pub fn flush_header(&self, generation: u64) -> Result<bool> {
        self.shared.flush_header(generation)
    }

    /// Write the current header unconditionally
    pub fn write_header(&self) -> Result<()> {
        self.shared.write_header()
    }

    /// Pad, flush the header, sync, and release the handle
    ///
    /// Every step is attempted; all failures are returned together.
    pub fn close(&self) -> Result<()> {
        if self.shared.file.read().is_none() {
            return Ok(());
        }

        let mut errors = ErrorAggregator::new();
        errors.capture(|| self.shared.pad_to_full_sector());
        errors.capture(|| self.shared.write_header());
        errors.capture(|| self.shared.sync());
        drop(self.shared.file.write().take());

        tracing::debug!(path = %self.shared.path.display(), "sector file closed");
        errors.finish()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn allocation(&self, index: u16) -> AllocationWord {
        self.shared.table.lock().allocs[index as usize]
    }

    /// Last-modified time of slot `index`, in Unix seconds
    pub fn timestamp(&self, index: u16) -> u32 {
        self.shared.table.lock().timestamps[index as usize]
    }

    /// Generation of the in-memory header
    pub fn generation(&self) -> u64 {
        self.shared.table.lock().version
    }

    /// Generation of the header last written to disk
    pub fn durable_generation(&self) -> u64 {
        *self.shared.durable.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.file.read().is_none()
    }

    pub fn stats(&self) -> Result<SectorStats> {
        let mut stats = {
            let table = self.shared.table.lock();
            let mut stats = SectorStats {
                used_sectors: table.bitmap.used_count(),
                ..SectorStats::default()
            };
            for word in table.allocs.iter().filter(|w| !w.is_empty()) {
                stats.entries += 1;
                stats.allocated_sectors += word.count();
            }
            stats.pending_free_sectors = table
                .leases
                .iter()
                .filter(|(_, lease)| lease.pending_free)
                .map(|(word, _)| word.count())
                .sum();
            stats
        };
        stats.file_len = self.shared.file()?.metadata()?.len();
        Ok(stats)
    }

    fn schedule_header_flush(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let depth = self.header_lane.execute(move || {
            if let Err(err) = shared.flush_header(generation) {
                tracing::error!(
                    path = %shared.path.display(),
                    generation,
                    error = %err,
                    "header flush failed"
                );
            }
        });
        if self.backlog_warning.is_some_and(|limit| limit.checked_add(1) == Some(depth)) {
            self.shared.reporter.warn(
                Warning::StorageBackend,
                ChunkPos::ZERO,
                &[depth as i64, generation as i64],
            );
        }
    }
}

impl Shared {
    fn file(&self) -> Result<MappedRwLockReadGuard<'_, File>> {
        RwLockReadGuard::try_map(self.file.read(), Option::as_ref).map_err(|_| AnvilError::Closed)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        write_all_at(&file, buf, offset).map_err(|e| self.reporter.io(e, ChunkPos::ZERO))
    }

    fn flush_header(&self, generation: u64) -> Result<bool> {
        let mut durable = self.durable.lock();
        let (snapshot, version) = {
            let table = self.table.lock();
            if generation <= *durable {
                return Ok(false);
            }
            (table.encode(), table.version)
        };
        self.write_at(&snapshot, 0)?;
        *durable = version;
        Ok(true)
    }

    fn write_header(&self) -> Result<()> {
        let mut durable = self.durable.lock();
        let (snapshot, version) = {
            let table = self.table.lock();
            (table.encode(), table.version)
        };
        self.write_at(&snapshot, 0)?;
        *durable = version;
        Ok(())
    }

    /// Round the file length up to a whole number of sectors
    fn pad_to_full_sector(&self) -> Result<()> {
        let len = self.file()?.metadata()?.len();
        let sector = SECTOR_BYTES as u64;
        let proper = len.div_ceil(sector) * sector;
        if proper != len {
            self.write_at(&[0u8], proper - 1)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file()?
            .sync_all()
            .map_err(|e| self.reporter.io(e, ChunkPos::ZERO))
    }
}

/// Reader reference on one allocation word, released on drop
struct ReadLease<'a> {
    table: &'a Mutex<Table>,
    word: AllocationWord,
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        self.table.lock().release(self.word);
    }
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// =============================================================================
// Positional I/O
// =============================================================================

/// Read until `buf` is full or the file ends; returns the bytes read
fn read_up_to(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
