//! Tests for SectorFile
//!
//! These tests verify:
//! - Header creation, persistence and validation on open
//! - Allocation word bookkeeping and sector reuse
//! - Header flush ordering across generations
//! - Error reporting for truncated and malformed files
//! - Header flush backlog warnings
//! - Concurrent reads during overwrites

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anvildb::concurrency::WorkerPool;
use anvildb::error::ErrorCategory;
use anvildb::region::{AllocationWord, SectorFile, HEADER_BYTES, SECTOR_BYTES};
use anvildb::report::{ErrorSink, Reporter};
use anvildb::{AnvilError, ChunkPos};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(u32, ErrorCategory)>>,
}

impl ErrorSink for RecordingSink {
    fn accept(&self, bin_id: u32, category: ErrorCategory, _pos: ChunkPos, _meta: &[i64]) {
        self.reports.lock().push((bin_id, category));
    }
}

impl RecordingSink {
    fn ids(&self) -> Vec<u32> {
        self.reports.lock().iter().map(|(id, _)| *id).collect()
    }
}

fn open(path: &Path, lane: &WorkerPool) -> SectorFile {
    SectorFile::open(path, lane.handle(), Reporter::tracing()).unwrap()
}

fn setup() -> (TempDir, WorkerPool, SectorFile) {
    let temp_dir = TempDir::new().unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let file = open(&temp_dir.path().join("r.0.0.mca"), &lane);
    (temp_dir, lane, file)
}

/// Block until every job queued on `lane` so far has run
fn drain(lane: &WorkerPool) {
    let (tx, rx) = mpsc::channel();
    lane.handle().execute(move || {
        let _ = tx.send(());
    });
    rx.recv().unwrap();
}

fn frame(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}

fn header_with(words: &[(usize, u32)]) -> Vec<u8> {
    let mut header = vec![0u8; HEADER_BYTES];
    for (index, raw) in words {
        header[index * 4..index * 4 + 4].copy_from_slice(&raw.to_be_bytes());
    }
    header
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_creates_zeroed_header() {
    let (temp_dir, _lane, file) = setup();

    let path = temp_dir.path().join("r.0.0.mca");
    assert!(path.exists());
    assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_BYTES as u64);
    for index in 0..1024u16 {
        assert!(file.allocation(index).is_empty());
        assert_eq!(file.timestamp(index), 0);
    }
}

#[test]
fn test_open_truncated_header_fails_and_reports() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.0.0.mca");
    fs::write(&path, vec![0u8; 100]).unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let sink = Arc::new(RecordingSink::default());

    let result = SectorFile::open(&path, lane.handle(), Reporter::new(sink.clone()));

    match result {
        Err(AnvilError::CorruptHeader { len, .. }) => assert_eq!(len, 100),
        Err(other) => panic!("expected corrupt header, got {:?}", other),
        Ok(_) => panic!("truncated header opened"),
    }
    assert_eq!(
        *sink.reports.lock(),
        vec![(0x30001, ErrorCategory::FatalCorruption)]
    );
}

#[test]
fn test_open_rejects_word_inside_header() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.0.0.mca");
    fs::write(&path, header_with(&[(7, AllocationWord::new(1, 1).raw())])).unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let sink = Arc::new(RecordingSink::default());

    let result = SectorFile::open(&path, lane.handle(), Reporter::new(sink.clone()));

    assert!(matches!(
        result,
        Err(AnvilError::MalformedIndex { index: 7, .. })
    ));
    assert_eq!(sink.ids(), vec![0x40001]);
}

#[test]
fn test_open_rejects_overlapping_words() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.0.0.mca");
    let header = header_with(&[
        (0, AllocationWord::new(2, 3).raw()),
        (1, AllocationWord::new(4, 1).raw()),
    ]);
    fs::write(&path, header).unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();

    let result = SectorFile::open(&path, lane.handle(), Reporter::tracing());

    assert!(matches!(
        result,
        Err(AnvilError::MalformedIndex { index: 1, .. })
    ));
}

#[test]
fn test_open_rejects_zero_sector_count() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.0.0.mca");
    fs::write(&path, header_with(&[(3, 5 << 8)])).unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();

    let result = SectorFile::open(&path, lane.handle(), Reporter::tracing());

    assert!(matches!(
        result,
        Err(AnvilError::MalformedIndex { index: 3, word }) if word == 5 << 8
    ));
}

// =============================================================================
// Read / Write Tests
// =============================================================================

#[test]
fn test_read_unallocated_slot_is_none() {
    let (_temp, _lane, file) = setup();

    assert_eq!(file.read_object(0).unwrap(), None);
    assert_eq!(file.read_object(1023).unwrap(), None);
}

#[test]
fn test_write_then_read() {
    let (_temp, _lane, file) = setup();
    let data = frame(100, 0x5A);

    file.write_object(12, &data).unwrap();

    let word = file.allocation(12);
    assert_eq!(word.start(), 2);
    assert_eq!(word.count(), 1);
    assert!(file.timestamp(12) > 0);

    // The file ends right after the frame, so only its bytes come back
    let read = file.read_object(12).unwrap().unwrap();
    assert_eq!(read, data);
}

#[test]
fn test_read_after_close_pad_returns_whole_sector() {
    let (temp_dir, lane, file) = setup();
    let path = temp_dir.path().join("r.0.0.mca");
    file.write_object(0, &frame(10, 1)).unwrap();
    file.close().unwrap();

    assert_eq!(fs::metadata(&path).unwrap().len(), 3 * SECTOR_BYTES as u64);

    let reopened = open(&path, &lane);
    let read = reopened.read_object(0).unwrap().unwrap();
    assert_eq!(read.len(), SECTOR_BYTES);
    assert_eq!(&read[..10], &frame(10, 1)[..]);
    assert!(read[10..].iter().all(|b| *b == 0));
}

#[test]
fn test_multi_sector_frame() {
    let (_temp, _lane, file) = setup();
    let data = frame(3 * SECTOR_BYTES + 1, 0x11);

    file.write_object(5, &data).unwrap();

    assert_eq!(file.allocation(5).count(), 4);
    assert_eq!(file.read_object(5).unwrap().unwrap(), data);
}

#[test]
fn test_overwrite_uses_fresh_range_and_frees_old() {
    let (_temp, _lane, file) = setup();

    file.write_object(0, &frame(10, 1)).unwrap();
    assert_eq!(file.allocation(0).start(), 2);

    file.write_object(0, &frame(10, 2)).unwrap();
    assert_eq!(file.allocation(0).start(), 3);

    // Sector 2 was released and is first fit again
    file.write_object(1, &frame(10, 3)).unwrap();
    assert_eq!(file.allocation(1).start(), 2);

    assert_eq!(file.read_object(0).unwrap().unwrap(), frame(10, 2));
    assert_eq!(file.read_object(1).unwrap().unwrap(), frame(10, 3));
}

#[test]
fn test_delete_object_frees_sectors() {
    let (_temp, _lane, file) = setup();
    file.write_object(9, &frame(2 * SECTOR_BYTES, 4)).unwrap();

    file.delete_object(9).unwrap();

    assert!(file.allocation(9).is_empty());
    assert_eq!(file.read_object(9).unwrap(), None);
    let stats = file.stats().unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.used_sectors, 2);
}

#[test]
fn test_delete_unallocated_slot_keeps_generation() {
    let (_temp, _lane, file) = setup();
    let before = file.generation();

    file.delete_object(40).unwrap();

    assert_eq!(file.generation(), before);
}

#[test]
fn test_frame_too_large_is_rejected() {
    let (_temp, _lane, file) = setup();
    let data = frame(255 * SECTOR_BYTES + 1, 0);

    let result = file.write_object(0, &data);

    assert!(matches!(result, Err(AnvilError::FrameTooLarge { .. })));
    assert!(file.allocation(0).is_empty());
    assert_eq!(file.stats().unwrap().used_sectors, 2);
}

#[test]
fn test_largest_inline_frame_fits() {
    let (_temp, _lane, file) = setup();
    let data = frame(255 * SECTOR_BYTES, 9);

    file.write_object(0, &data).unwrap();

    assert_eq!(file.allocation(0).count(), 255);
}

#[test]
fn test_sector_accounting() {
    let (_temp, _lane, file) = setup();
    for index in 0..64u16 {
        let len = (index as usize % 5) * SECTOR_BYTES + 7;
        file.write_object(index, &frame(len, index as u8)).unwrap();
    }
    for index in (0..64u16).step_by(3) {
        file.delete_object(index).unwrap();
    }
    for index in (0..64u16).step_by(4) {
        file.write_object(index, &frame(SECTOR_BYTES * 2, 0xEE)).unwrap();
    }

    let stats = file.stats().unwrap();
    assert_eq!(stats.used_sectors, stats.allocated_sectors + 2);
    assert_eq!(stats.pending_free_sectors, 0);
}

// =============================================================================
// Header Persistence Tests
// =============================================================================

#[test]
fn test_header_survives_reopen() {
    let (temp_dir, lane, file) = setup();
    let path = temp_dir.path().join("r.0.0.mca");
    file.write_object(100, &frame(5000, 7)).unwrap();
    file.write_object(1023, &frame(20, 8)).unwrap();
    let word = file.allocation(100);
    let stamp = file.timestamp(100);
    file.close().unwrap();

    let reopened = open(&path, &lane);

    assert_eq!(reopened.allocation(100), word);
    assert_eq!(reopened.timestamp(100), stamp);
    assert_eq!(&reopened.read_object(100).unwrap().unwrap()[..5000], &frame(5000, 7)[..]);
    assert_eq!(&reopened.read_object(1023).unwrap().unwrap()[..20], &frame(20, 8)[..]);
}

#[test]
fn test_header_flushed_without_close() {
    let (temp_dir, lane, file) = setup();
    let path = temp_dir.path().join("r.0.0.mca");
    let generation = file.write_object(3, &frame(64, 1)).unwrap();

    drain(&lane);

    assert_eq!(file.durable_generation(), generation);
    let header = fs::read(&path).unwrap();
    let raw = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    assert_eq!(AllocationWord::from_raw(raw), file.allocation(3));
}

#[test]
fn test_stale_header_flush_is_skipped() {
    let (_temp, lane, file) = setup();

    // Hold the lane so the queued flushes cannot run yet
    let (release_tx, release_rx) = mpsc::channel::<()>();
    lane.handle().execute(move || {
        let _ = release_rx.recv();
    });

    let first = file.write_object(0, &frame(10, 1)).unwrap();
    let second = file.write_object(1, &frame(10, 2)).unwrap();
    assert!(second > first);

    assert!(file.flush_header(second).unwrap());
    assert!(!file.flush_header(first).unwrap());
    assert!(!file.flush_header(second).unwrap());

    release_tx.send(()).unwrap();
    drain(&lane);
    assert_eq!(file.durable_generation(), second);
}

#[test]
fn test_header_flush_backlog_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let file = SectorFile::open(
        temp_dir.path().join("r.0.0.mca"),
        lane.handle(),
        Reporter::new(sink.clone()),
    )
    .unwrap()
    .with_backlog_warning(1);

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    lane.handle().execute(move || {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
    });
    started_rx.recv().unwrap();

    for index in 0..4 {
        file.write_object(index, &frame(10, index as u8)).unwrap();
    }

    // Reported once, when the second queued flush crossed the limit
    assert_eq!(sink.reports.lock().clone(), vec![(0x00002, ErrorCategory::Degradation)]);

    release_tx.send(()).unwrap();
    drain(&lane);
    assert_eq!(file.durable_generation(), file.generation());
}

#[test]
fn test_no_backlog_warning_by_default() {
    let temp_dir = TempDir::new().unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let file = SectorFile::open(
        temp_dir.path().join("r.0.0.mca"),
        lane.handle(),
        Reporter::new(sink.clone()),
    )
    .unwrap();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    lane.handle().execute(move || {
        let _ = release_rx.recv();
    });
    for index in 0..16 {
        file.write_object(index, &frame(10, 1)).unwrap();
    }

    assert!(sink.ids().is_empty());
    release_tx.send(()).unwrap();
    drain(&lane);
}

#[test]
fn test_close_is_idempotent() {
    let (_temp, _lane, file) = setup();
    file.write_object(0, &frame(10, 1)).unwrap();

    file.close().unwrap();
    file.close().unwrap();

    assert!(file.is_closed());
    assert!(matches!(file.read_object(0), Err(AnvilError::Closed)));
}

#[test]
fn test_truncated_file_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.0.0.mca");
    fs::write(&path, header_with(&[(4, AllocationWord::new(6, 1).raw())])).unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let file = SectorFile::open(&path, lane.handle(), Reporter::new(sink.clone())).unwrap();

    let result = file.read_object(4);

    assert!(matches!(result, Err(AnvilError::TruncatedFile { index: 4 })));
    assert_eq!(sink.ids(), vec![0x30002]);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_reads_during_overwrites() {
    let (_temp, _lane, file) = setup();
    let file = Arc::new(file);
    for index in 0..8u16 {
        file.write_object(index, &frame(SECTOR_BYTES + 10, 0)).unwrap();
    }

    let writer = {
        let file = Arc::clone(&file);
        thread::spawn(move || {
            for round in 1..=50u8 {
                for index in 0..8u16 {
                    file.write_object(index, &frame(SECTOR_BYTES + 10, round)).unwrap();
                }
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let file = Arc::clone(&file);
            thread::spawn(move || {
                for _ in 0..200 {
                    for index in 0..8u16 {
                        let read = file.read_object(index).unwrap().unwrap();
                        // Every byte of one frame comes from the same write
                        let fill = read[0];
                        assert!(read[..SECTOR_BYTES + 10].iter().all(|b| *b == fill));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let stats = file.stats().unwrap();
    assert_eq!(stats.entries, 8);
    assert_eq!(stats.pending_free_sectors, 0);
    assert_eq!(stats.used_sectors, stats.allocated_sectors + 2);
}
