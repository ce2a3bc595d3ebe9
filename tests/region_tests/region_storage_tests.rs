//! Tests for RegionStorage
//!
//! These tests verify:
//! - Round trips under every compression method
//! - Frame layout written to the sector file
//! - Inline vs external placement around the oversize threshold
//! - Reads racing an external to inline overwrite
//! - Classification of damaged frames

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anvildb::concurrency::WorkerPool;
use anvildb::error::ErrorCategory;
use anvildb::region::{
    Compression, OversizeStorage, RegionStorage, SectorFile, EXTERNAL_FLAG, MAX_ENTRY_SECTORS,
    SECTOR_BYTES,
};
use anvildb::report::{ErrorSink, Reporter};
use anvildb::{AnvilError, ChunkPos};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(u32, ErrorCategory, ChunkPos)>>,
}

impl ErrorSink for RecordingSink {
    fn accept(&self, bin_id: u32, category: ErrorCategory, pos: ChunkPos, _meta: &[i64]) {
        self.reports.lock().push((bin_id, category, pos));
    }
}

struct Fixture {
    storage: RegionStorage,
    sink: Arc<RecordingSink>,
    _lane: WorkerPool,
    temp_dir: TempDir,
}

fn setup(compression: Compression, threshold_sectors: u32) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let lane = WorkerPool::new("test-lane", 1).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let reporter = Reporter::new(sink.clone());
    let file = SectorFile::open(
        temp_dir.path().join("r.0.0.mca"),
        lane.handle(),
        reporter.clone(),
    )
    .unwrap();
    let storage = RegionStorage::new(
        file,
        Arc::new(OversizeStorage::new(temp_dir.path())),
        compression,
        threshold_sectors,
        reporter,
    );
    Fixture {
        storage,
        sink,
        _lane: lane,
        temp_dir,
    }
}

fn raw_frame(declared: u32, method: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = declared.to_be_bytes().to_vec();
    frame.push(method);
    frame.extend_from_slice(payload);
    frame
}

/// Bytes that no codec can shrink
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_every_method() {
    for method in Compression::ALL {
        let fx = setup(method, 256);
        let pos = ChunkPos::new(3, 4);
        let data = b"{\"sections\":[]}".repeat(100);

        fx.storage.write(pos, &data).unwrap();

        assert_eq!(fx.storage.read(pos).unwrap(), Some(data), "{}", method);
    }
}

#[test]
fn test_empty_payload_round_trip() {
    let fx = setup(Compression::None, 256);
    let pos = ChunkPos::new(0, 0);

    fx.storage.write(pos, &[]).unwrap();

    assert_eq!(fx.storage.read(pos).unwrap(), Some(Vec::new()));
}

#[test]
fn test_missing_chunk_is_none() {
    let fx = setup(Compression::Deflate, 256);

    assert_eq!(fx.storage.read(ChunkPos::new(31, 31)).unwrap(), None);
}

#[test]
fn test_frame_layout() {
    let fx = setup(Compression::Gzip, 256);
    let pos = ChunkPos::new(2, 1);
    let data = b"abcabcabc".repeat(20);
    let encoded = fx.storage.encode(&data).unwrap();

    fx.storage.write_encoded(pos, &encoded).unwrap();

    let frame = fx
        .storage
        .sector_file()
        .read_object(pos.local_index())
        .unwrap()
        .unwrap();
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    assert_eq!(declared as usize, encoded.len() + 1);
    assert_eq!(frame[4], Compression::Gzip.id());
    assert_eq!(&frame[5..5 + encoded.len()], &encoded[..]);
}

#[test]
fn test_overwrite_and_remove() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(10, 20);

    fx.storage.write(pos, b"first").unwrap();
    fx.storage.write(pos, b"second").unwrap();
    assert_eq!(fx.storage.read(pos).unwrap(), Some(b"second".to_vec()));

    fx.storage.remove(pos).unwrap();
    assert_eq!(fx.storage.read(pos).unwrap(), None);
}

#[test]
fn test_slots_are_independent() {
    let fx = setup(Compression::Deflate, 256);
    for index in 0..1024u16 {
        let pos = ChunkPos::from_region_index(0, 0, index);
        fx.storage.write(pos, &index.to_be_bytes()).unwrap();
    }

    for index in 0..1024u16 {
        let pos = ChunkPos::from_region_index(0, 0, index);
        assert_eq!(fx.storage.read(pos).unwrap(), Some(index.to_be_bytes().to_vec()));
    }
    let stats = fx.storage.sector_file().stats().unwrap();
    assert_eq!(stats.entries, 1024);
    assert_eq!(stats.used_sectors, 1024 + 2);
}

// =============================================================================
// Oversize Tests
// =============================================================================

#[test]
fn test_oversize_entry_goes_external() {
    let fx = setup(Compression::None, 2);
    let pos = ChunkPos::new(7, 9);
    let data = noise(3 * SECTOR_BYTES);

    fx.storage.write(pos, &data).unwrap();

    let frame = fx
        .storage
        .sector_file()
        .read_object(pos.local_index())
        .unwrap()
        .unwrap();
    assert_eq!(&frame[..5], &raw_frame(1, Compression::None.id() | EXTERNAL_FLAG, &[])[..]);
    assert_eq!(fx.storage.sector_file().allocation(pos.local_index()).count(), 1);
    assert!(fx.temp_dir.path().join("c.7.9.mcc").is_file());

    assert_eq!(fx.storage.read(pos).unwrap(), Some(data));
}

#[test]
fn test_oversize_threshold_boundary() {
    let fx = setup(Compression::None, 1);
    let inline = ChunkPos::new(0, 0);
    let external = ChunkPos::new(1, 0);

    // Frame of 4095 bytes stays inline, 4096 reaches the threshold
    fx.storage.write(inline, &noise(SECTOR_BYTES - 6)).unwrap();
    fx.storage.write(external, &noise(SECTOR_BYTES - 5)).unwrap();

    assert!(!fx.temp_dir.path().join("c.0.0.mcc").exists());
    assert!(fx.temp_dir.path().join("c.1.0.mcc").exists());
    assert_eq!(fx.storage.read(inline).unwrap().unwrap().len(), SECTOR_BYTES - 6);
    assert_eq!(fx.storage.read(external).unwrap().unwrap().len(), SECTOR_BYTES - 5);
}

#[test]
fn test_default_threshold_has_no_unstorable_band() {
    let fx = setup(Compression::None, 256);
    let largest_inline = ChunkPos::new(2, 0);
    let past_inline = ChunkPos::new(3, 0);
    let band = ChunkPos::new(4, 0);

    // 255 full sectors is the most one allocation word can address
    let largest = noise(MAX_ENTRY_SECTORS * SECTOR_BYTES - 5);
    let past = noise(MAX_ENTRY_SECTORS * SECTOR_BYTES - 4);
    let within_band = noise(1_046_000);

    fx.storage.write(largest_inline, &largest).unwrap();
    fx.storage.write(past_inline, &past).unwrap();
    fx.storage.write(band, &within_band).unwrap();

    assert!(!fx.temp_dir.path().join("c.2.0.mcc").exists());
    assert!(fx.temp_dir.path().join("c.3.0.mcc").exists());
    assert!(fx.temp_dir.path().join("c.4.0.mcc").exists());
    assert_eq!(
        fx.storage.sector_file().allocation(largest_inline.local_index()).count(),
        MAX_ENTRY_SECTORS
    );
    assert_eq!(fx.storage.read(largest_inline).unwrap(), Some(largest));
    assert_eq!(fx.storage.read(past_inline).unwrap(), Some(past));
    assert_eq!(fx.storage.read(band).unwrap(), Some(within_band));
}

#[test]
fn test_inline_overwrite_clears_external_entry() {
    let fx = setup(Compression::None, 1);
    let pos = ChunkPos::new(4, 4);
    let oversize = fx.temp_dir.path().join("c.4.4.mcc");

    fx.storage.write(pos, &noise(2 * SECTOR_BYTES)).unwrap();
    assert!(oversize.exists());

    fx.storage.write(pos, b"small").unwrap();
    assert!(!oversize.exists());
    assert_eq!(fx.storage.read(pos).unwrap(), Some(b"small".to_vec()));
}

#[test]
fn test_reads_survive_external_to_inline_overwrite() {
    let fx = setup(Compression::None, 1);
    let pos = ChunkPos::new(5, 5);
    let large = noise(2 * SECTOR_BYTES);
    let small = b"small".to_vec();

    for _ in 0..50 {
        fx.storage.write(pos, &large).unwrap();
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while !stop.load(Ordering::Acquire) {
                        let value = fx.storage.read(pos).unwrap().unwrap();
                        assert!(value == large || value == small);
                    }
                });
            }
            fx.storage.write(pos, &small).unwrap();
            stop.store(true, Ordering::Release);
        });

        assert_eq!(fx.storage.read(pos).unwrap(), Some(small.clone()));
    }
}

#[test]
fn test_remove_clears_external_entry() {
    let fx = setup(Compression::None, 1);
    let pos = ChunkPos::new(-1, -1);

    fx.storage.write(pos, &noise(2 * SECTOR_BYTES)).unwrap();
    fx.storage.remove(pos).unwrap();

    assert!(!fx.temp_dir.path().join("c.-1.-1.mcc").exists());
    assert_eq!(fx.storage.read(pos).unwrap(), None);
}

#[test]
fn test_external_entry_with_inline_stream_warns() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(6, 0);
    let data = b"outside".to_vec();
    let encoded = Compression::Deflate.wrap(&data).unwrap();
    OversizeStorage::new(fx.temp_dir.path())
        .put(pos, &encoded)
        .unwrap()
        .commit()
        .unwrap();
    let frame = raw_frame(4, Compression::Deflate.id() | EXTERNAL_FLAG, b"abc");
    fx.storage
        .sector_file()
        .write_object(pos.local_index(), &frame)
        .unwrap();

    assert_eq!(fx.storage.read(pos).unwrap(), Some(data));
    assert_eq!(
        *fx.sink.reports.lock(),
        vec![(0x10001, ErrorCategory::Inconsistency, pos)]
    );
}

// =============================================================================
// Damaged Frame Tests
// =============================================================================

fn write_raw(fx: &Fixture, pos: ChunkPos, frame: &[u8]) {
    fx.storage
        .sector_file()
        .write_object(pos.local_index(), frame)
        .unwrap();
}

#[test]
fn test_truncated_frame_header() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(1, 1);
    write_raw(&fx, pos, &[0, 0, 0]);

    let result = fx.storage.read(pos);

    assert!(matches!(
        result,
        Err(AnvilError::TruncatedStreamHeader { available: 3, .. })
    ));
}

#[test]
fn test_void_stream() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(1, 2);
    write_raw(&fx, pos, &raw_frame(0, 2, &[]));

    let err = fx.storage.read(pos).unwrap_err();

    assert!(matches!(err, AnvilError::VoidStream { .. }));
    assert_eq!(err.category(), ErrorCategory::PartialCorruption);
}

#[test]
fn test_negative_stream_size() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(1, 3);
    write_raw(&fx, pos, &raw_frame(0x8000_0000, 2, &[]));

    assert!(matches!(
        fx.storage.read(pos),
        Err(AnvilError::InvalidStreamSize { size, .. }) if size < 0
    ));
}

#[test]
fn test_truncated_stream() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(1, 4);
    write_raw(&fx, pos, &raw_frame(10_000, 2, b"short"));

    assert!(matches!(
        fx.storage.read(pos),
        Err(AnvilError::TruncatedStream { declared: 9_999, .. })
    ));
}

#[test]
fn test_unknown_method() {
    let fx = setup(Compression::Deflate, 256);
    let pos = ChunkPos::new(1, 5);
    write_raw(&fx, pos, &raw_frame(2, 9, b"x"));

    assert!(matches!(
        fx.storage.read(pos),
        Err(AnvilError::UnsupportedCompressionMethod(9))
    ));
}

#[test]
fn test_damaged_entry_does_not_affect_neighbours() {
    let fx = setup(Compression::Deflate, 256);
    let good = ChunkPos::new(0, 0);
    let bad = ChunkPos::new(1, 0);
    fx.storage.write(good, b"intact").unwrap();
    write_raw(&fx, bad, &raw_frame(0, 2, &[]));

    assert!(fx.storage.read(bad).is_err());
    assert_eq!(fx.storage.read(good).unwrap(), Some(b"intact".to_vec()));
    // Entry-level damage goes back to the caller, not to the sink
    assert!(fx.sink.reports.lock().is_empty());
}
