//! Chunk coordinates
//!
//! A chunk is addressed by an `(x, z)` pair. Every 32×32 block of chunks
//! shares one region file; the low five bits of each axis pick the slot
//! inside that region's header.

use std::fmt;

/// Number of chunks along one side of a region
pub const REGION_SIDE: i32 = 32;

/// Number of chunk slots in one region file
pub const REGION_CHUNKS: usize = (REGION_SIDE * REGION_SIDE) as usize;

/// Immutable chunk coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    /// The origin, used when an error is not tied to a specific chunk
    pub const ZERO: ChunkPos = ChunkPos { x: 0, z: 0 };

    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub const fn region_x(&self) -> i32 {
        self.x >> 5
    }

    pub const fn region_z(&self) -> i32 {
        self.z >> 5
    }

    pub const fn local_x(&self) -> i32 {
        self.x & 31
    }

    pub const fn local_z(&self) -> i32 {
        self.z & 31
    }

    /// Header slot of this chunk inside its region (0..1024)
    pub const fn local_index(&self) -> u16 {
        (self.local_x() | (self.local_z() << 5)) as u16
    }

    /// Packed region coordinates, used to key the region cache
    pub const fn region_key(&self) -> u64 {
        (self.region_x() as u32 as u64) | ((self.region_z() as u32 as u64) << 32)
    }

    /// Rebuild a position from its region coordinates and a header slot
    pub const fn from_region_index(region_x: i32, region_z: i32, index: u16) -> Self {
        let index = index as i32;
        Self {
            x: (region_x << 5) | (index & 31),
            z: (region_z << 5) | ((index >> 5) & 31),
        }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

impl From<(i32, i32)> for ChunkPos {
    fn from((x, z): (i32, i32)) -> Self {
        Self::new(x, z)
    }
}
