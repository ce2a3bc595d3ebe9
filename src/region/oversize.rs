//! Oversize Storage
//!
//! Side files for payloads too large for inline sector storage. Each entry
//! lives in `c.<x>.<z>.mcc` next to the region files and holds the raw
//! compressed payload with no header.
//!
//! Writes go to a temporary file first; the caller decides when to rename
//! it over the canonical path, so a crash mid-write never damages an
//! existing entry.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;
use crate::pos::ChunkPos;

/// Directory of oversize entries
#[derive(Debug, Clone)]
pub struct OversizeStorage {
    directory: PathBuf,
}

/// A fully written oversize entry waiting to be made visible
///
/// Dropping it without calling [`commit`](PendingOversize::commit) removes
/// the temporary file.
#[derive(Debug)]
pub struct PendingOversize {
    temp: NamedTempFile,
    target: PathBuf,
}

impl OversizeStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Write `bytes` to a fresh temporary file in the storage directory
    pub fn put(&self, pos: ChunkPos, bytes: &[u8]) -> Result<PendingOversize> {
        let mut temp = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.directory)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_data()?;

        Ok(PendingOversize {
            temp,
            target: self.path(pos),
        })
    }

    /// Read the whole entry for `pos`
    ///
    /// A missing file is an error: callers only ask for entries whose frame
    /// claims external placement.
    pub fn get(&self, pos: ChunkPos) -> Result<Vec<u8>> {
        Ok(fs::read(self.path(pos))?)
    }

    /// Delete the entry for `pos`; a no-op if there is none
    pub fn clear(&self, pos: ChunkPos) -> Result<()> {
        match fs::remove_file(self.path(pos)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.path(pos).is_file()
    }

    /// Canonical path of the entry for `pos`
    pub fn path(&self, pos: ChunkPos) -> PathBuf {
        self.directory.join(format!("c.{}.{}.mcc", pos.x, pos.z))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl PendingOversize {
    /// Atomically rename the temporary file over the canonical path
    pub fn commit(self) -> Result<()> {
        self.temp.persist(&self.target).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}
