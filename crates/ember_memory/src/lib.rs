//! # EMBER Memory
//!
//! Custom sub-allocators that carve large pre-reserved buffers into engine objects.
//!
//! ## Allocators
//!
//! 1. **`PoolAllocator`** - fixed-size blocks, LIFO free list, O(1) alloc / free
//! 2. **`BuddyAllocator`** - power-of-two blocks, split on demand, coalesce on free
//!
//! Both implement [`BaseAllocator`], whose `create` / `destroy` pair moves a
//! value into a block and hands back an owning [`Handle`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_memory::{BaseAllocator, PoolAllocator};
//!
//! let pool: PoolAllocator<Projectile> = PoolAllocator::new(4096)?;
//! let shot = pool.create(Projectile::default())?;
//! // ...
//! pool.destroy(shot);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod alloc;
pub mod error;
pub mod math;

pub use alloc::{BaseAllocator, BuddyAllocator, Handle, PoolAllocator, SIZE_CLASSES};
pub use error::{MemoryError, MemoryResult};
