//! Error Reporting
//!
//! The storage layers report categorized conditions to a pluggable sink.
//! The sink is handed to the engine explicitly through [`Config`]; there is
//! no process-wide registry.
//!
//! [`Config`]: crate::config::Config

use std::fmt;
use std::sync::Arc;

use crate::error::{AnvilError, ErrorCategory, Warning};
use crate::pos::ChunkPos;

/// Receiver for categorized warnings and errors
pub trait ErrorSink: Send + Sync {
    /// Accept one report
    ///
    /// `bin_id` is the stable numeric id of the condition; `meta` carries
    /// condition-specific numbers (sizes, slot indices, queue depths).
    fn accept(&self, bin_id: u32, category: ErrorCategory, pos: ChunkPos, meta: &[i64]);
}

/// Default sink: one `tracing` event per report
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn accept(&self, bin_id: u32, category: ErrorCategory, pos: ChunkPos, meta: &[i64]) {
        let id = format!("{:#07x}", bin_id);
        match category {
            ErrorCategory::NonIssue => {
                tracing::debug!(id = %id, category = %category, %pos, ?meta, "storage report")
            }
            ErrorCategory::Degradation | ErrorCategory::Inconsistency => {
                tracing::warn!(id = %id, category = %category, %pos, ?meta, "storage report")
            }
            _ => tracing::error!(id = %id, category = %category, %pos, ?meta, "storage report"),
        }
    }
}

/// Cloneable handle every storage layer reports through
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ErrorSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self { sink }
    }

    /// Reporter backed by [`TracingSink`]
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// Report a warning; the operation carries on
    pub fn warn(&self, warning: Warning, pos: ChunkPos, meta: &[i64]) {
        self.sink.accept(warning.bin_id(), warning.category(), pos, meta);
    }

    /// Report a file- or header-level error and hand it back for propagation
    ///
    /// Entry-level errors only go back to the caller that hit them.
    pub fn raise(&self, err: AnvilError, pos: ChunkPos, meta: &[i64]) -> AnvilError {
        if let Some(code) = err.code() {
            if code.category().is_fatal() {
                self.sink.accept(code.bin_id(), code.category(), pos, meta);
            }
        }
        err
    }

    /// Classify an I/O failure and report it if the backend is unusable
    pub fn io(&self, err: std::io::Error, pos: ChunkPos) -> AnvilError {
        self.raise(AnvilError::classify_io(err), pos, &[])
    }

    pub fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}
