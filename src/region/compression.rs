//! Payload Compression
//!
//! Stream codecs keyed by the 1-byte method id stored in every chunk frame.
//! The ids are historical and not ordinal:
//!
//! | id | method |
//! |----|--------|
//! | 1  | gzip   |
//! | 2  | deflate (zlib stream) |
//! | 3  | none   |

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use crate::error::{AnvilError, Result};

/// Compression method of a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    Gzip,
    #[default]
    Deflate,
    None,
}

impl Compression {
    pub const ALL: [Compression; 3] = [Compression::Gzip, Compression::Deflate, Compression::None];

    /// Wire id of this method
    pub fn id(self) -> u8 {
        match self {
            Compression::Gzip => 1,
            Compression::Deflate => 2,
            Compression::None => 3,
        }
    }

    /// Look up a method by wire id
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Deflate),
            3 => Ok(Compression::None),
            other => Err(AnvilError::UnsupportedCompressionMethod(other)),
        }
    }

    /// Compress raw bytes
    pub fn wrap(self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(raw)?;
                Ok(encoder.finish()?)
            }
            Compression::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(raw)?;
                Ok(encoder.finish()?)
            }
            Compression::None => Ok(raw.to_vec()),
        }
    }

    /// Decompress stored bytes
    pub fn unwrap(self, compressed: &[u8]) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(compressed.len() * 2);
        match self {
            Compression::Gzip => {
                GzDecoder::new(compressed).read_to_end(&mut raw)?;
            }
            Compression::Deflate => {
                ZlibDecoder::new(compressed).read_to_end(&mut raw)?;
            }
            Compression::None => raw.extend_from_slice(compressed),
        }
        Ok(raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
            Compression::None => "none",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = AnvilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" => Ok(Compression::Gzip),
            "deflate" | "zlib" => Ok(Compression::Deflate),
            "none" => Ok(Compression::None),
            other => Err(AnvilError::Config(format!(
                "unknown compression method '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<u8> for Compression {
    type Error = AnvilError;

    fn try_from(id: u8) -> Result<Self> {
        Compression::from_id(id)
    }
}
