//! # AnvilDB
//!
//! A concurrent storage engine for chunk-addressed binary records, stored in
//! the Anvil region-file format:
//! - 32×32 chunks per region file, addressed through an 8 KiB header
//! - First-fit sector allocation with deferred frees for in-flight readers
//! - Per-entry gzip / zlib / uncompressed payloads
//! - Side files for entries too large for inline storage
//! - Bounded LRU cache of open region files
//! - Coalescing of overlapping operations on the same chunk
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LevelStorage                          │
//! │            (submit_get / submit_set / submit_delete)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Region Cache (LRU, bounded)                 │
//! │         evicted regions close on the serial lane            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Reorder    │          │ Worker Pool │
//!   │  Buffer     │          │ (compress,  │
//!   │ (per slot)  │          │  file I/O)  │
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                                   ▼
//!                           ┌───────────────┐      ┌───────────┐
//!                           │ RegionStorage │─────▶│ Oversize  │
//!                           │  (framing)    │      │ (.mcc)    │
//!                           └──────┬────────┘      └───────────┘
//!                                  │
//!                                  ▼
//!                           ┌───────────────┐
//!                           │  SectorFile   │
//!                           │ (.mca header, │
//!                           │  sectors)     │
//!                           └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod pos;
pub mod report;

pub mod concurrency;
pub mod region;
pub mod level;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AnvilError, ErrorCategory, Result, Warning};
pub use config::Config;
pub use pos::ChunkPos;
pub use report::{ErrorSink, Reporter, TracingSink};
pub use region::Compression;
pub use level::{ChunkStore, LevelStats, LevelStorage, Ticket};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AnvilDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
