//! # Memory Error Types
//!
//! All errors that can occur while reserving or carving allocator buffers.

use thiserror::Error;

/// Errors that can occur in the allocator layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// An allocator was asked to reserve room for zero objects.
    #[error("allocator capacity must be greater than zero")]
    ZeroCapacity,

    /// The requested buffer size does not fit in the address space.
    #[error("capacity overflow: {count} blocks of {block_size} bytes")]
    CapacityOverflow {
        /// Number of blocks requested.
        count: usize,
        /// Size of one block in bytes.
        block_size: usize,
    },

    /// The system refused to reserve the backing buffer.
    #[error("out of memory: failed to reserve {bytes} bytes")]
    OutOfMemory {
        /// Size of the buffer that could not be reserved.
        bytes: usize,
    },

    /// No free block large enough remains in the allocator.
    #[error("capacity exhausted: requested {requested} bytes, {available} bytes free")]
    CapacityExhausted {
        /// Bytes requested by the caller.
        requested: usize,
        /// Bytes still free in the allocator.
        available: usize,
    },

    /// The request is larger than any block the allocator can hand out.
    #[error("block too large: requested {requested} bytes, largest block is {block} bytes")]
    BlockTooLarge {
        /// Bytes requested by the caller.
        requested: usize,
        /// Largest block size the allocator supports.
        block: usize,
    },

    /// The type needs a stricter alignment than the allocator's blocks provide.
    #[error("misaligned type: needs {align}-byte alignment, blocks guarantee {supported}")]
    Misaligned {
        /// Alignment required by the type.
        align: usize,
        /// Alignment guaranteed by every block.
        supported: usize,
    },
}

/// Result type for allocator operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
