//! # Pool Allocator
//!
//! Fixed-size block allocator for objects that are frequently allocated and freed.
//!
//! ## Safety Note
//!
//! The pool carves raw blocks out of one reserved buffer and threads its free
//! list through the free blocks themselves, so it needs unsafe code. A free
//! block stores the index of the next free block in its first word; a live
//! block belongs to whoever allocated it. Every free-list read or write
//! happens under the pool lock.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::base::BaseAllocator;
use crate::error::{MemoryError, MemoryResult};
use crate::math::align_up;

/// Free-list terminator.
const NIL: usize = usize::MAX;

/// Mutable pool bookkeeping, guarded by the pool lock.
struct PoolState {
    /// Index of the most recently freed block, or `NIL`.
    free_head: usize,
    /// Blocks handed out at least once by the bump cursor.
    bumped: usize,
    /// Blocks currently owned by callers.
    live: usize,
}

/// A pool allocator for fixed-size objects.
///
/// One buffer of `count * block_size` bytes is reserved up front, where the
/// block size is `max(size_of::<T>(), size_of::<usize>())` rounded up to the
/// block alignment. Blocks are handed out by bumping through never-used slots
/// and recycled through a LIFO free list.
///
/// # Thread Safety
///
/// All mutation happens under one pool-wide lock; distinct pools never contend.
///
/// # Example
///
/// ```rust,ignore
/// struct Particle { x: f32, y: f32, life: f32 }
///
/// let pool: PoolAllocator<Particle> = PoolAllocator::new(10_000)?;
///
/// // Allocate - O(1), no heap allocation
/// let particle = pool.create(Particle { x: 0.0, y: 0.0, life: 1.0 })?;
///
/// // Free - O(1), block goes to the head of the free list
/// pool.destroy(particle);
/// ```
pub struct PoolAllocator<T> {
    /// Base of the reserved buffer.
    buffer: NonNull<u8>,
    /// Layout the buffer was reserved with.
    layout: Layout,
    /// Size of one block in bytes.
    block_size: usize,
    /// Alignment of every block.
    block_align: usize,
    /// Number of blocks in the buffer.
    total_blocks: usize,
    /// Free list and counters.
    state: Mutex<PoolState>,
    /// Marker for T.
    _phantom: PhantomData<T>,
}

// SAFETY: the buffer is owned by the pool, block contents are owned by their
// handles, and free-list state is only touched under the lock.
unsafe impl<T: Send> Send for PoolAllocator<T> {}
// SAFETY: see above; `&PoolAllocator` only mutates through the lock.
unsafe impl<T: Send> Sync for PoolAllocator<T> {}

impl<T> PoolAllocator<T> {
    /// Creates a new pool with room for `count` objects.
    ///
    /// All memory is reserved upfront.
    ///
    /// # Arguments
    ///
    /// * `count` - Maximum number of live objects
    ///
    /// # Errors
    ///
    /// Fails on a zero count, on size overflow, or if the buffer cannot be reserved.
    pub fn new(count: usize) -> MemoryResult<Self> {
        if count == 0 {
            return Err(MemoryError::ZeroCapacity);
        }

        let block_align = mem::align_of::<T>().max(mem::align_of::<usize>());
        let raw_size = mem::size_of::<T>().max(mem::size_of::<usize>());
        let overflow = MemoryError::CapacityOverflow {
            count,
            block_size: raw_size,
        };
        let block_size = align_up(raw_size, block_align).ok_or_else(|| overflow.clone())?;
        let bytes = block_size.checked_mul(count).ok_or_else(|| overflow.clone())?;
        let layout = Layout::from_size_align(bytes, block_align).map_err(|_| overflow)?;

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let buffer = NonNull::new(raw).ok_or(MemoryError::OutOfMemory { bytes })?;

        tracing::debug!(count, block_size, bytes, "pool allocator reserved");

        Ok(Self {
            buffer,
            layout,
            block_size,
            block_align,
            total_blocks: count,
            state: Mutex::new(PoolState {
                free_head: NIL,
                bumped: 0,
                live: 0,
            }),
            _phantom: PhantomData,
        })
    }

    /// Returns the total number of blocks.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.total_blocks
    }

    /// Returns the size of one block in bytes.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of blocks currently handed out.
    #[inline]
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.state.lock().live
    }

    /// Returns the number of free bytes (`(total - live) * block_size`).
    #[inline]
    #[must_use]
    pub fn free_allocation(&self) -> usize {
        self.free_bytes(self.state.lock().live)
    }

    /// Returns the base address of the reserved buffer.
    #[inline]
    #[must_use]
    pub const fn buffer(&self) -> NonNull<u8> {
        self.buffer
    }

    /// Returns true if `ptr` points inside this pool's buffer.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.buffer.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.layout.size()
    }

    /// Frees a possibly-null block. Null is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must satisfy the contract of [`BaseAllocator::free`].
    pub unsafe fn free_ptr(&self, ptr: *mut u8) {
        if let Some(block) = NonNull::new(ptr) {
            self.free(block, self.block_size);
        }
    }

    /// Bytes left for `live` handed-out blocks.
    #[inline]
    fn free_bytes(&self, live: usize) -> usize {
        (self.total_blocks - live) * self.block_size
    }

    /// Address of block `index`.
    #[inline]
    fn block_at(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.total_blocks);
        // SAFETY: `index < total_blocks`, so the offset stays inside the buffer.
        unsafe { NonNull::new_unchecked(self.buffer.as_ptr().add(index * self.block_size)) }
    }

    /// Index of the block starting at `ptr`.
    #[inline]
    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        debug_assert!(self.contains(ptr), "pointer does not belong to this pool");
        let offset = ptr.as_ptr() as usize - self.buffer.as_ptr() as usize;
        debug_assert_eq!(offset % self.block_size, 0, "pointer is not a block start");
        offset / self.block_size
    }
}

// SAFETY: blocks are disjoint slices of the buffer, `block_align`-aligned by
// construction, and recycled only after `free`.
unsafe impl<T> BaseAllocator for PoolAllocator<T> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size > self.block_size {
            tracing::trace!(size, block_size = self.block_size, "pool request larger than block");
            return None;
        }

        let mut state = self.state.lock();
        if self.block_size > self.free_bytes(state.live) {
            tracing::trace!(live = state.live, "pool exhausted");
            return None;
        }

        let index = if state.free_head == NIL {
            if state.bumped == self.total_blocks {
                return None;
            }
            let index = state.bumped;
            state.bumped += 1;
            index
        } else {
            let index = state.free_head;
            // SAFETY: free blocks hold the next free index in their first word.
            state.free_head = unsafe { self.block_at(index).cast::<usize>().as_ptr().read() };
            index
        };

        state.live += 1;
        Some(self.block_at(index))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) {
        let index = self.index_of(ptr);
        let mut state = self.state.lock();
        // SAFETY: the caller gave the block back, so its first word is ours to
        // reuse as a free-list link.
        ptr.cast::<usize>().as_ptr().write(state.free_head);
        state.free_head = index;
        state.live -= 1;
    }

    #[inline]
    fn block_align(&self) -> usize {
        self.block_align
    }

    #[inline]
    fn max_block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    fn available(&self) -> usize {
        self.free_allocation()
    }
}

impl<T> Drop for PoolAllocator<T> {
    fn drop(&mut self) {
        let live = self.state.get_mut().live;
        tracing::debug!(live, bytes = self.layout.size(), "pool allocator released");
        // SAFETY: the buffer was reserved with `self.layout` and is released once.
        unsafe { alloc::dealloc(self.buffer.as_ptr(), self.layout) };
    }
}
