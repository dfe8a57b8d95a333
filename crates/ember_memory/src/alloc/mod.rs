//! # Block Allocators
//!
//! Pre-reserved buffers carved into application objects.
//!
//! ## Design Philosophy
//!
//! Every allocator reserves its buffer once, at construction. During gameplay:
//! - No heap allocations
//! - Free lists are threaded through the free blocks themselves
//! - Failure is a plain `None` the caller must check

mod base;
mod buddy;
mod pool;

pub use base::{BaseAllocator, Handle};
pub use buddy::{BuddyAllocator, SIZE_CLASSES};
pub use pool::PoolAllocator;
