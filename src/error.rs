//! Error types shared by the heap and the pools.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias used across the crate.
pub type Result<T, E = HeapError> = std::result::Result<T, E>;

/// Conditions the allocator reports to its callers.
///
/// "No room in this segment" is not one of them: segments answer that with a
/// plain `Ok(None)` while the heap keeps looking.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The request can never fit in a segment of the configured size, no
    /// matter how empty it is.
    #[error("requested {requested} bytes but a segment can hold at most {capacity}")]
    OutOfMemory { requested: usize, capacity: usize },

    /// An invalid per-processor heap index was asked for.
    #[error("heap index {index} out of range ({count} heaps)")]
    OutOfRange { index: usize, count: usize },

    /// Pool bookkeeping found itself in an inconsistent state. This is a
    /// caller bug and cannot be recovered from locally.
    #[error("memory corruption detected: {reason}")]
    MemoryCorruption { reason: &'static str },

    /// The kernel refused to map a new segment.
    #[error("the platform could not map {len} bytes")]
    Platform { len: usize },

    /// A typed allocation needs stronger alignment than the heap provides.
    #[error("alignment of {align} bytes exceeds what the heap guarantees")]
    Alignment { align: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HeapError {
    pub(crate) const fn corruption(reason: &'static str) -> Self {
        Self::MemoryCorruption { reason }
    }
}
