//! Error types for allocator construction.

use std::alloc::LayoutError;

use thiserror::Error;

/// Errors raised when an allocator is configured with an impossible size.
#[derive(Debug, Error)]
pub enum CollectionsError {
    #[error("block allocator chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("chunk size {0} overflows the block layout")]
    SizeOverflow(usize),

    #[error("invalid layout: {0}")]
    Layout(#[from] LayoutError),
}

/// Result type for collection operations.
pub type CollectionsResult<T> = Result<T, CollectionsError>;
