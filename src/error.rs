//! Error types for AnvilDB
//!
//! Provides a unified error type for all operations, plus the severity
//! taxonomy used when failures are reported to the error sink.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::pos::ChunkPos;

/// Result type alias using AnvilError
pub type Result<T> = std::result::Result<T, AnvilError>;

// =============================================================================
// Severity
// =============================================================================

/// How bad a reported condition is, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    /// Informational, no effect on operation
    NonIssue,
    /// Performance is degraded but every operation still completes
    Degradation,
    /// Data is inconsistent but one interpretation was chosen and served
    Inconsistency,
    /// One entry is unreadable; other keys keep working
    PartialCorruption,
    /// Region-level structure is broken; shut down for operator intervention
    FatalCorruption,
    /// The storage backend failed; shut down for operator intervention
    FatalBackend,
}

impl ErrorCategory {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::FatalCorruption | Self::FatalBackend)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NonIssue => "NON_ISSUE",
            Self::Degradation => "DEGRADATION",
            Self::Inconsistency => "INCONSISTENCY",
            Self::PartialCorruption => "PARTIAL_CORRUPTION",
            Self::FatalCorruption => "FATAL_CORRUPTION",
            Self::FatalBackend => "FATAL_BACKEND",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Conditions that are reported but never fail an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    /// Worker queue depth exceeded the configured limit
    QueueDepth,
    /// A storage backend bottleneck was detected
    StorageBackend,
    /// An entry carries both an inline and an external stream
    DualStream,
}

impl Warning {
    pub fn bin_id(self) -> u32 {
        match self {
            Self::QueueDepth => 0x00001,
            Self::StorageBackend => 0x00002,
            Self::DualStream => 0x10001,
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::QueueDepth | Self::StorageBackend => ErrorCategory::Degradation,
            Self::DualStream => ErrorCategory::Inconsistency,
        }
    }
}

/// Stable numeric identifiers for reportable errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidStreamSize,
    TruncatedStreamHeader,
    TruncatedStream,
    VoidStream,
    HeaderTruncated,
    TruncatedFile,
    MalformedIndex,
    StorageSpace,
    Permission,
}

impl ErrorCode {
    pub fn bin_id(self) -> u32 {
        match self {
            Self::InvalidStreamSize => 0x20001,
            Self::TruncatedStreamHeader => 0x20002,
            Self::TruncatedStream => 0x20003,
            Self::VoidStream => 0x20004,
            Self::HeaderTruncated => 0x30001,
            Self::TruncatedFile => 0x30002,
            Self::MalformedIndex => 0x40001,
            Self::StorageSpace => 0x40002,
            Self::Permission => 0x40003,
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidStreamSize
            | Self::TruncatedStreamHeader
            | Self::TruncatedStream
            | Self::VoidStream => ErrorCategory::PartialCorruption,
            Self::HeaderTruncated | Self::TruncatedFile => ErrorCategory::FatalCorruption,
            Self::MalformedIndex | Self::StorageSpace | Self::Permission => {
                ErrorCategory::FatalBackend
            }
        }
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// Unified error type for AnvilDB operations
///
/// `Clone` so a single failure can be handed to every caller that joined
/// the same in-flight operation.
#[derive(Debug, Clone, Error)]
pub enum AnvilError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("storage space exhausted: {0}")]
    StorageSpace(Arc<io::Error>),

    #[error("permission denied: {0}")]
    Permission(Arc<io::Error>),

    // -------------------------------------------------------------------------
    // Region File Errors (fatal)
    // -------------------------------------------------------------------------
    #[error("region header of {path:?} is truncated: {len} of 8192 bytes")]
    CorruptHeader { path: PathBuf, len: usize },

    #[error("zero bytes read for allocated slot {index}")]
    TruncatedFile { index: u16 },

    #[error("malformed allocation word {word:#010x} in slot {index}")]
    MalformedIndex { index: u16, word: u32 },

    // -------------------------------------------------------------------------
    // Entry Errors (one chunk lost, engine keeps serving)
    // -------------------------------------------------------------------------
    #[error("chunk {pos} declares a negative stream size {size}")]
    InvalidStreamSize { pos: ChunkPos, size: i64 },

    #[error("chunk {pos} frame header is truncated: {available} bytes")]
    TruncatedStreamHeader { pos: ChunkPos, available: usize },

    #[error("chunk {pos} stream is truncated: declared {declared}, available {available}")]
    TruncatedStream {
        pos: ChunkPos,
        declared: usize,
        available: usize,
    },

    #[error("chunk {pos} is allocated but its stream was never written")]
    VoidStream { pos: ChunkPos },

    #[error("unsupported compression method {0}")]
    UnsupportedCompressionMethod(u8),

    #[error("frame of {len} bytes exceeds the 255 sector entry limit")]
    FrameTooLarge { len: usize },

    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("storage is closed")]
    Closed,

    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<AnvilError>),
}

impl From<io::Error> for AnvilError {
    fn from(err: io::Error) -> Self {
        AnvilError::Io(Arc::new(err))
    }
}

impl AnvilError {
    /// Reportable code of this error, if it has one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::StorageSpace(_) => Some(ErrorCode::StorageSpace),
            Self::Permission(_) => Some(ErrorCode::Permission),
            Self::CorruptHeader { .. } => Some(ErrorCode::HeaderTruncated),
            Self::TruncatedFile { .. } => Some(ErrorCode::TruncatedFile),
            Self::MalformedIndex { .. } => Some(ErrorCode::MalformedIndex),
            Self::InvalidStreamSize { .. } => Some(ErrorCode::InvalidStreamSize),
            Self::TruncatedStreamHeader { .. } => Some(ErrorCode::TruncatedStreamHeader),
            Self::TruncatedStream { .. } => Some(ErrorCode::TruncatedStream),
            Self::VoidStream { .. } => Some(ErrorCode::VoidStream),
            _ => None,
        }
    }

    /// Severity of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedCompressionMethod(_) => ErrorCategory::PartialCorruption,
            Self::Multiple(errors) => errors
                .iter()
                .map(AnvilError::category)
                .max()
                .unwrap_or(ErrorCategory::NonIssue),
            other => other
                .code()
                .map(ErrorCode::category)
                .unwrap_or(ErrorCategory::PartialCorruption),
        }
    }

    /// Whether the storage instance should be shut down after this error
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }

    /// Sort an I/O failure into the backend taxonomy
    pub fn classify_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            return AnvilError::Permission(Arc::new(err));
        }
        if is_out_of_space(&err) {
            return AnvilError::StorageSpace(Arc::new(err));
        }
        AnvilError::Io(Arc::new(err))
    }
}

#[cfg(unix)]
fn is_out_of_space(err: &io::Error) -> bool {
    // ENOSPC and EDQUOT
    matches!(err.raw_os_error(), Some(28) | Some(122))
}

#[cfg(not(unix))]
fn is_out_of_space(err: &io::Error) -> bool {
    // ERROR_DISK_FULL and ERROR_HANDLE_DISK_FULL
    matches!(err.raw_os_error(), Some(112) | Some(39))
}

fn join_errors(errors: &[AnvilError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// Aggregation
// =============================================================================

/// Runs independent cleanup steps and keeps every failure
///
/// No step is skipped because an earlier one failed.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Vec<AnvilError>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one step, recording its error if it fails
    pub fn capture<T>(&mut self, step: impl FnOnce() -> Result<T>) -> Option<T> {
        match step() {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn push(&mut self, err: AnvilError) {
        match err {
            AnvilError::Multiple(inner) => self.errors.extend(inner),
            other => self.errors.push(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Raise everything collected so far
    pub fn finish(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(AnvilError::Multiple(self.errors)),
        }
    }
}
