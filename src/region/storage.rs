//! Region Storage
//!
//! Chunk framing on top of a [`SectorFile`]. Each slot holds one frame:
//!
//! ```text
//! ┌──────────────────┬──────────────┬────────────────────────────┐
//! │ declared size (4)│ method (1)   │ payload (declared - 1)     │
//! └──────────────────┴──────────────┴────────────────────────────┘
//! ```
//!
//! Bit 7 of the method byte flags an external entry: the frame is a stub
//! with an empty payload and the compressed bytes live in the oversize
//! store instead.

use std::io;
use std::sync::Arc;

use crate::error::{AnvilError, Result, Warning};
use crate::pos::ChunkPos;
use crate::report::Reporter;

use super::compression::Compression;
use super::oversize::OversizeStorage;
use super::sector_file::SectorFile;
use super::{FRAME_HEADER_BYTES, MAX_ENTRY_SECTORS, SECTOR_BYTES};

/// Method byte flag marking an external (oversize) entry
pub const EXTERNAL_FLAG: u8 = 0x80;

/// Framed, compressed chunk storage for one region
pub struct RegionStorage {
    file: SectorFile,
    oversize: Arc<OversizeStorage>,
    compression: Compression,
    /// Frames of this many bytes or more go to the oversize store; never
    /// more than one byte past the largest inline entry
    threshold_bytes: usize,
    reporter: Reporter,
}

impl RegionStorage {
    pub fn new(
        file: SectorFile,
        oversize: Arc<OversizeStorage>,
        compression: Compression,
        threshold_sectors: u32,
        reporter: Reporter,
    ) -> Self {
        Self {
            file,
            oversize,
            compression,
            threshold_bytes: (threshold_sectors as usize * SECTOR_BYTES)
                .min(MAX_ENTRY_SECTORS * SECTOR_BYTES + 1),
            reporter,
        }
    }

    /// Read and decompress the chunk at `pos`
    pub fn read(&self, pos: ChunkPos) -> Result<Option<Vec<u8>>> {
        match self.read_frame(pos) {
            // The slot went inline after its stub was read and the side file
            // was cleared; the slot now holds the newer frame
            Err(AnvilError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(%pos, "oversize entry vanished, rereading slot");
                self.read_frame(pos)
            }
            other => other,
        }
    }

    fn read_frame(&self, pos: ChunkPos) -> Result<Option<Vec<u8>>> {
        let frame = match self.file.read_object(pos.local_index())? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.len() < FRAME_HEADER_BYTES {
            return Err(AnvilError::TruncatedStreamHeader {
                pos,
                available: frame.len(),
            });
        }
        let declared = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if declared == 0 {
            return Err(AnvilError::VoidStream { pos });
        }
        let method = frame[4];
        let size = declared as i64 - 1;

        if method & EXTERNAL_FLAG != 0 {
            if size != 0 {
                self.reporter.warn(Warning::DualStream, pos, &[size]);
            }
            let compression = Compression::from_id(method & !EXTERNAL_FLAG)?;
            let payload = self.oversize.get(pos)?;
            return compression.unwrap(&payload).map(Some);
        }

        let available = frame.len() - FRAME_HEADER_BYTES;
        if size < 0 {
            return Err(AnvilError::InvalidStreamSize { pos, size });
        }
        let size = size as usize;
        if size > available {
            return Err(AnvilError::TruncatedStream {
                pos,
                declared: size,
                available,
            });
        }

        let compression = Compression::from_id(method)?;
        let payload = &frame[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + size];
        compression.unwrap(payload).map(Some)
    }

    /// Compress and store `data` at `pos`
    pub fn write(&self, pos: ChunkPos, data: &[u8]) -> Result<()> {
        let encoded = self.encode(data)?;
        self.write_encoded(pos, &encoded)
    }

    /// Compress `data` with this region's method
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.compression.wrap(data)
    }

    /// Store an already compressed payload at `pos`
    ///
    /// Payloads whose frame would reach the threshold are written to the
    /// oversize store behind an external stub frame.
    pub fn write_encoded(&self, pos: ChunkPos, encoded: &[u8]) -> Result<()> {
        let index = pos.local_index();
        let method = self.compression.id();

        if encoded.len() + FRAME_HEADER_BYTES >= self.threshold_bytes {
            let pending = self.oversize.put(pos, encoded)?;
            self.file.write_object(index, &frame(method | EXTERNAL_FLAG, &[]))?;
            pending.commit()?;
            tracing::trace!(%pos, bytes = encoded.len(), "chunk stored externally");
        } else {
            self.file.write_object(index, &frame(method, encoded))?;
            self.oversize.clear(pos)?;
        }
        Ok(())
    }

    /// Remove the chunk at `pos`, including any oversize entry
    pub fn remove(&self, pos: ChunkPos) -> Result<()> {
        self.file.delete_object(pos.local_index())?;
        self.oversize.clear(pos)
    }

    pub fn close(&self) -> Result<()> {
        self.file.close()
    }

    pub fn sector_file(&self) -> &SectorFile {
        &self.file
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }
}

/// Build a frame: declared size, method byte, payload
fn frame(method: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    frame.push(method);
    frame.extend_from_slice(payload);
    frame
}
