//! # Base Allocator
//!
//! The contract every EMBER block allocator implements, plus the typed
//! create / destroy layer built on top of it.
//!
//! ## Safety Note
//!
//! Constructing a value inside a raw block and destroying it again needs
//! unsafe code. The [`Handle`] returned by [`BaseAllocator::create`] is the
//! only owner of that value, so every unsafe block here relies on one
//! invariant: a handle's pointer is a live block of its allocator holding an
//! initialized `T`, until the handle is dropped or consumed.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::error::{MemoryError, MemoryResult};

/// A block allocator over one pre-reserved buffer.
///
/// `allocate` and `free` are the raw contract: failure is an ordinary `None`,
/// never a panic, and callers must check it. `create` / `destroy` layer typed
/// construction on top.
///
/// # Safety
///
/// Implementors must hand out blocks that are at least `size` bytes long,
/// aligned to [`block_align`](Self::block_align), disjoint from every other
/// live block, and valid until they are passed back to [`free`](Self::free).
pub unsafe trait BaseAllocator {
    /// Carves a block of at least `size` bytes out of the buffer.
    ///
    /// Returns `None` when the allocator has no room left.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `size`, and must not have been freed since.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);

    /// Alignment guaranteed for every block.
    fn block_align(&self) -> usize;

    /// Largest single request the allocator can ever satisfy.
    fn max_block_size(&self) -> usize;

    /// Bytes not currently handed out.
    fn available(&self) -> usize;

    /// Moves `value` into a freshly allocated block.
    ///
    /// The returned handle is the value's sole owner; dropping it (or passing
    /// it to [`destroy`](Self::destroy)) runs `T`'s destructor and frees the block.
    ///
    /// # Errors
    ///
    /// * [`MemoryError::Misaligned`] if `T` needs a stricter alignment than the blocks
    /// * [`MemoryError::BlockTooLarge`] if `T` can never fit in one block
    /// * [`MemoryError::CapacityExhausted`] if no block is free right now
    fn create<T>(&self, value: T) -> MemoryResult<Handle<'_, T, Self>>
    where
        Self: Sized,
    {
        let size = mem::size_of::<T>().max(1);
        let align = mem::align_of::<T>();

        if align > self.block_align() {
            return Err(MemoryError::Misaligned {
                align,
                supported: self.block_align(),
            });
        }
        if size > self.max_block_size() {
            return Err(MemoryError::BlockTooLarge {
                requested: size,
                block: self.max_block_size(),
            });
        }

        let Some(block) = self.allocate(size) else {
            return Err(MemoryError::CapacityExhausted {
                requested: size,
                available: self.available(),
            });
        };

        let typed = block.cast::<T>();
        // SAFETY: the block is at least `size_of::<T>()` bytes, aligned for `T`
        // (checked above) and exclusively ours until freed.
        unsafe { typed.as_ptr().write(value) };

        Ok(Handle {
            ptr: typed,
            size,
            allocator: self,
            _owns: PhantomData,
        })
    }

    /// Destroys a value created by this allocator and returns its block.
    fn destroy<T>(&self, handle: Handle<'_, T, Self>)
    where
        Self: Sized,
    {
        debug_assert!(
            ptr::eq(handle.allocator, self),
            "handle destroyed through a different allocator"
        );
        drop(handle);
    }
}

/// Owning handle to a value living inside an allocator's buffer.
///
/// Handles cannot be copied or cloned. The borrow of the allocator keeps the
/// buffer alive for as long as any handle exists.
pub struct Handle<'a, T, A: BaseAllocator> {
    /// The constructed value.
    ptr: NonNull<T>,
    /// Size that was requested from the allocator.
    size: usize,
    /// Allocator that owns the block.
    allocator: &'a A,
    /// Marks ownership of a `T` for drop check.
    _owns: PhantomData<T>,
}

impl<T, A: BaseAllocator> Handle<'_, T, A> {
    /// Raw address of the value inside the allocator's buffer.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Address of the underlying block, as the allocator sees it.
    #[inline]
    #[must_use]
    pub fn block(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Moves the value out and returns the block to the allocator.
    #[must_use]
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        // SAFETY: the value is initialized and, with `this` never dropped, is
        // read exactly once before its block is released.
        unsafe {
            let value = this.ptr.as_ptr().read();
            this.allocator.free(this.ptr.cast(), this.size);
            value
        }
    }
}

impl<T, A: BaseAllocator> Deref for Handle<'_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the handle owns an initialized value.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A: BaseAllocator> DerefMut for Handle<'_, T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the handle owns an initialized value and `&mut self` is unique.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A: BaseAllocator> Drop for Handle<'_, T, A> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and dropped exactly once, then its
        // block goes back to the allocator that produced it.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.allocator.free(self.ptr.cast(), self.size);
        }
    }
}

impl<T: fmt::Debug, A: BaseAllocator> fmt::Debug for Handle<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("ptr", &self.ptr)
            .field("value", &**self)
            .finish()
    }
}

// SAFETY: a handle behaves like a `Box<T>` whose allocator is shared by reference.
unsafe impl<T: Send, A: BaseAllocator + Sync> Send for Handle<'_, T, A> {}
// SAFETY: shared access to a handle only exposes `&T`.
unsafe impl<T: Sync, A: BaseAllocator + Sync> Sync for Handle<'_, T, A> {}
