//! # Buddy Allocator
//!
//! Power-of-two block allocator that splits large blocks on demand and
//! recombines buddies when both halves are free.
//!
//! ## Safety Note
//!
//! Free lists are threaded through the free blocks themselves: the first
//! word of a free block holds the buffer offset of the next free block of the
//! same size class. Offsets are always multiples of the smallest block size,
//! which is at least one `usize`, so every link is aligned. All list traffic
//! happens under the allocator lock.
//!
//! ## Layout
//!
//! ```text
//! class 6 (64B)  [               A               ]
//! class 5 (32B)  [       A       ][       B      ]   B = A ^ 32
//! class 4 (16B)  [  A   ][  C   ]                    C = A ^ 16
//! ```
//!
//! A block at offset `o` in class `i` has its buddy at `o ^ 2^i`. The
//! relationship is positional and never stored.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::base::BaseAllocator;
use crate::error::{MemoryError, MemoryResult};
use crate::math::{clamp_within, log2, upper_power_of_two};

/// Number of supported size classes, one per power of two.
pub const SIZE_CLASSES: usize = 64;

/// Strictest alignment the buffer is reserved with.
const MAX_BUFFER_ALIGN: usize = 4096;

/// Free-list terminator.
const NIL: usize = usize::MAX;

/// Mutable allocator bookkeeping, guarded by the allocator lock.
struct BuddyState {
    /// Head offset of each size class's free list, or `NIL`.
    heads: [usize; SIZE_CLASSES],
    /// Blocks currently handed out. Diagnostic only.
    alloc_count: usize,
}

/// A buddy-system allocator over one reserved buffer.
///
/// `T` is the smallest block type: the minimum block is `size_of::<T>()`
/// rounded up to a power of two (and to at least one `usize`). Any type can
/// be created, but sizes that are not powers of two waste the remainder of
/// their block.
///
/// # Thread Safety
///
/// Allocation and free are mutually exclusive under one allocator-wide lock
/// covering pop, split and coalesce.
///
/// # Example
///
/// ```rust,ignore
/// // 1024 slots of the smallest block type
/// let buddy: BuddyAllocator<[u8; 16]> = BuddyAllocator::new(1024)?;
///
/// let small = buddy.create([0u8; 16])?;   // one 16-byte block
/// let large = buddy.create([0u64; 40])?;  // rounded up to 512 bytes
/// ```
pub struct BuddyAllocator<T> {
    /// Base of the reserved buffer.
    buffer: NonNull<u8>,
    /// Layout the buffer was reserved with.
    layout: Layout,
    /// Smallest block size in bytes.
    min_block: usize,
    /// Size class of the whole buffer.
    top_class: usize,
    /// Alignment of every block.
    block_align: usize,
    /// Free lists and counters.
    state: Mutex<BuddyState>,
    /// Marker for T.
    _phantom: PhantomData<T>,
}

// SAFETY: the buffer is owned by the allocator, block contents are owned by
// their handles, and free-list state is only touched under the lock.
unsafe impl<T: Send> Send for BuddyAllocator<T> {}
// SAFETY: see above; `&BuddyAllocator` only mutates through the lock.
unsafe impl<T: Send> Sync for BuddyAllocator<T> {}

impl<T> BuddyAllocator<T> {
    /// Creates a buddy allocator with room for `object_count` smallest blocks.
    ///
    /// Both the count and the smallest block size are rounded up to powers of
    /// two. The whole buffer starts as one free block in the top size class.
    ///
    /// # Errors
    ///
    /// Fails on a zero count, on size overflow, or if the buffer cannot be reserved.
    pub fn new(object_count: usize) -> MemoryResult<Self> {
        if object_count == 0 {
            return Err(MemoryError::ZeroCapacity);
        }

        let raw_block = mem::size_of::<T>().max(mem::size_of::<usize>());
        let overflow = MemoryError::CapacityOverflow {
            count: object_count,
            block_size: raw_block,
        };
        let count = upper_power_of_two(object_count).ok_or_else(|| overflow.clone())?;
        let min_block = upper_power_of_two(raw_block).ok_or_else(|| overflow.clone())?;
        let capacity = min_block.checked_mul(count).ok_or_else(|| overflow.clone())?;

        let block_align = min_block.min(MAX_BUFFER_ALIGN);
        let layout = Layout::from_size_align(capacity, block_align).map_err(|_| overflow)?;

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let buffer = NonNull::new(raw).ok_or(MemoryError::OutOfMemory { bytes: capacity })?;

        let top_class = clamp_within(log2(capacity), SIZE_CLASSES - 1, 0);

        let allocator = Self {
            buffer,
            layout,
            min_block,
            top_class,
            block_align,
            state: Mutex::new(BuddyState {
                heads: [NIL; SIZE_CLASSES],
                alloc_count: 0,
            }),
            _phantom: PhantomData,
        };

        {
            let mut state = allocator.state.lock();
            // SAFETY: the buffer is entirely free.
            unsafe { allocator.push(&mut state, top_class, 0) };
        }

        tracing::debug!(count, min_block, capacity, top_class, "buddy allocator reserved");
        Ok(allocator)
    }

    /// Returns the total buffer size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the smallest block size in bytes.
    #[inline]
    #[must_use]
    pub const fn min_block_size(&self) -> usize {
        self.min_block
    }

    /// Returns the size class holding the whole buffer.
    #[inline]
    #[must_use]
    pub const fn top_class(&self) -> usize {
        self.top_class
    }

    /// Returns the number of blocks currently handed out.
    #[inline]
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.state.lock().alloc_count
    }

    /// Returns the base address of the reserved buffer.
    #[inline]
    #[must_use]
    pub const fn buffer(&self) -> NonNull<u8> {
        self.buffer
    }

    /// Returns true if `ptr` points inside this allocator's buffer.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.buffer.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.capacity()
    }

    /// Size class a request of `bytes` is served from, or `None` if it can never fit.
    #[must_use]
    pub fn size_class_of(&self, bytes: usize) -> Option<usize> {
        let size = upper_power_of_two(bytes.max(1))?.max(self.min_block);
        (size <= self.capacity()).then(|| log2(size))
    }

    /// Number of free blocks in size class `class`.
    #[must_use]
    pub fn free_blocks_in_class(&self, class: usize) -> usize {
        if class >= SIZE_CLASSES {
            return 0;
        }
        let state = self.state.lock();
        let mut count = 0;
        let mut cursor = state.heads[class];
        while cursor != NIL {
            count += 1;
            // SAFETY: `cursor` is a free block of this class.
            cursor = unsafe { self.next_of(cursor) };
        }
        count
    }

    /// Total bytes held in free lists.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        (0..SIZE_CLASSES)
            .map(|class| self.free_blocks_in_class(class) << class)
            .sum()
    }

    /// Address of the block at `offset`.
    #[inline]
    fn block_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.capacity());
        // SAFETY: `offset` is inside the buffer.
        unsafe { NonNull::new_unchecked(self.buffer.as_ptr().add(offset)) }
    }

    /// Reads the free-list link stored in the block at `offset`.
    ///
    /// # Safety
    ///
    /// The block must be on a free list.
    #[inline]
    unsafe fn next_of(&self, offset: usize) -> usize {
        self.block_at(offset).cast::<usize>().as_ptr().read()
    }

    /// Writes the free-list link of the block at `offset`.
    ///
    /// # Safety
    ///
    /// The block must be free and owned by the allocator.
    #[inline]
    unsafe fn set_next(&self, offset: usize, next: usize) {
        self.block_at(offset).cast::<usize>().as_ptr().write(next);
    }

    /// Pushes a free block onto its class list.
    ///
    /// # Safety
    ///
    /// The block at `offset` must be free and not on any list.
    unsafe fn push(&self, state: &mut BuddyState, class: usize, offset: usize) {
        self.set_next(offset, state.heads[class]);
        state.heads[class] = offset;
    }

    /// Pops the head of a non-empty class list.
    ///
    /// # Safety
    ///
    /// `state.heads[class]` must not be `NIL`.
    unsafe fn pop(&self, state: &mut BuddyState, class: usize) -> usize {
        let offset = state.heads[class];
        state.heads[class] = self.next_of(offset);
        offset
    }

    /// Unlinks `target` from a class list. Returns false if it was not there.
    ///
    /// # Safety
    ///
    /// The class list must be well formed.
    unsafe fn remove(&self, state: &mut BuddyState, class: usize, target: usize) -> bool {
        let mut prev = NIL;
        let mut cursor = state.heads[class];
        while cursor != NIL {
            let next = self.next_of(cursor);
            if cursor == target {
                if prev == NIL {
                    state.heads[class] = next;
                } else {
                    self.set_next(prev, next);
                }
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    /// Halves the block at `offset` from `class` down to `wanted`, pushing
    /// every upper half onto the next-smaller class. Returns the lower half.
    ///
    /// # Safety
    ///
    /// The block must have just been popped and be owned by the caller.
    unsafe fn split(&self, state: &mut BuddyState, offset: usize, class: usize, wanted: usize) -> usize {
        let mut class = class;
        while class > wanted {
            class -= 1;
            self.push(state, class, offset + (1usize << class));
        }
        offset
    }
}

// SAFETY: blocks are disjoint power-of-two slices of the buffer at offsets
// that are multiples of their size, so they are `block_align`-aligned.
unsafe impl<T> BaseAllocator for BuddyAllocator<T> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let Some(wanted) = self.size_class_of(size) else {
            tracing::trace!(size, capacity = self.capacity(), "buddy request larger than buffer");
            return None;
        };

        let mut state = self.state.lock();

        let mut class = wanted;
        while state.heads[class] == NIL {
            class += 1;
            if class > self.top_class || class >= SIZE_CLASSES {
                tracing::trace!(size, "buddy allocator exhausted");
                return None;
            }
        }

        // SAFETY: the class list is non-empty, and the popped block is ours to split.
        let offset = unsafe {
            let block = self.pop(&mut state, class);
            self.split(&mut state, block, class, wanted)
        };

        state.alloc_count += 1;
        Some(self.block_at(offset))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(self.contains(ptr), "pointer does not belong to this allocator");

        let mut size = upper_power_of_two(size.max(1))
            .unwrap_or(self.capacity())
            .max(self.min_block);
        let mut offset = ptr.as_ptr() as usize - self.buffer.as_ptr() as usize;

        let mut state = self.state.lock();
        state.alloc_count = state.alloc_count.saturating_sub(1);

        loop {
            let class = log2(size);
            let buddy = offset ^ size;

            // Top class, or a buddy outside the buffer: nothing to merge with.
            if size >= self.capacity() || buddy + size > self.capacity() {
                self.push(&mut state, class, offset);
                return;
            }

            if self.remove(&mut state, class, buddy) {
                offset = offset.min(buddy);
                size <<= 1;
                continue;
            }

            self.push(&mut state, class, offset);
            return;
        }
    }

    #[inline]
    fn block_align(&self) -> usize {
        self.block_align
    }

    #[inline]
    fn max_block_size(&self) -> usize {
        self.capacity()
    }

    #[inline]
    fn available(&self) -> usize {
        self.free_bytes()
    }
}

impl<T> Drop for BuddyAllocator<T> {
    fn drop(&mut self) {
        let live = self.state.get_mut().alloc_count;
        tracing::debug!(live, bytes = self.capacity(), "buddy allocator released");
        // SAFETY: the buffer was reserved with `self.layout` and is released once.
        unsafe { alloc::dealloc(self.buffer.as_ptr(), self.layout) };
    }
}
