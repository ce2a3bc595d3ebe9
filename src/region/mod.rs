//! Region Module
//!
//! The Anvil region-file format and the layers that read and write it.
//!
//! ## File Format (`r.<regionX>.<regionZ>.mca`)
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Header (8192 bytes, big-endian)        │
//! │ ┌────────────────────────────────────┐ │
//! │ │ 1024 × allocation word (4)         │ │
//! │ │   (start sector << 8) | sectors    │ │
//! │ ├────────────────────────────────────┤ │
//! │ │ 1024 × timestamp, Unix seconds (4) │ │
//! │ └────────────────────────────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Sectors (4096 bytes each, from #2)     │
//! │ ┌────────┬────────┬──────────────────┐ │
//! │ │Size (4)│Method  │ Payload          │ │
//! │ └────────┴────────┴──────────────────┘ │
//! │ ... one frame per allocated slot ...   │
//! └────────────────────────────────────────┘
//! ```
//!
//! ## Layers
//! - [`SectorBitmap`]: first-fit sector allocator
//! - [`Compression`]: payload codecs keyed by method id
//! - [`SectorFile`]: header, allocation table, raw frame I/O
//! - [`OversizeStorage`]: side files for payloads past the sector limit
//! - [`RegionStorage`]: framing, compression and inline/external placement

mod bitmap;
mod compression;
mod oversize;
mod sector_file;
mod storage;

pub use bitmap::SectorBitmap;
pub use compression::Compression;
pub use oversize::{OversizeStorage, PendingOversize};
pub use sector_file::{sectors_for, AllocationWord, SectorFile, SectorStats};
pub use storage::{RegionStorage, EXTERNAL_FLAG};

/// Size of one sector in bytes
pub const SECTOR_BYTES: usize = 4096;

/// Size of the region header in bytes
pub const HEADER_BYTES: usize = 2 * SECTOR_BYTES;

/// Sectors permanently taken by the header
pub const HEADER_SECTORS: usize = 2;

/// Largest sector count one allocation word can hold
pub const MAX_ENTRY_SECTORS: usize = 255;

/// Frames reaching this many sectors are stored externally by default
pub const DEFAULT_OVERSIZE_THRESHOLD_SECTORS: u32 = 256;

/// Declared size (4) + method byte (1)
pub const FRAME_HEADER_BYTES: usize = 5;

/// File name of the region holding `(region_x, region_z)`
pub fn region_file_name(region_x: i32, region_z: i32) -> String {
    format!("r.{}.{}.mca", region_x, region_z)
}
