//! # Allocation Tracker
//!
//! Counts every allocation that passes through [`TrackingAllocator`] and, in
//! verbose mode, remembers where each live block was allocated.
//!
//! ## Block Layout
//!
//! ```text
//! base                         user pointer
//! |<------------- prefix ------------->|
//! [ padding ... ][ AllocationHeader ]  [ user bytes ... ]
//! ```
//!
//! The prefix is the header size rounded up to the block's alignment, so the
//! user pointer keeps the alignment the caller asked for and the header sits
//! immediately before it. Live verbose blocks are chained through their
//! headers into an insertion-ordered list with a tail pointer.
//!
//! ## Locking
//!
//! One mutex guards the counters and the live list. The lock is never held
//! while a call stack is captured or dropped, and every allocation made on a
//! thread that is already inside the tracker is passed through untracked.
//!
//! ## Safety Note
//!
//! This module implements `GlobalAlloc` and walks raw header pointers, which
//! needs unsafe code. Every header reached through the live list belongs to a
//! block that has not been freed yet: a block leaves the list under the lock
//! before its memory goes back to the inner allocator.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{const_mutex, Mutex};
use serde::Deserialize;

use crate::callstack::CallStack;
use crate::error::{TrackerError, TrackerResult};
use crate::units::ByteUnit;

/// Header magic of a live block.
const MAGIC_LIVE: u64 = 0x454D_4245_524C_4956;
/// Header magic written when a block is freed.
const MAGIC_FREED: u64 = 0x454D_4245_5246_5245;

/// Frames dropped above `CallStack::capture`: the tracker's own
/// `alloc_with`. Any allocator shim frames above it stay in the stack and
/// are identical for every call site.
const CAPTURE_SKIP: usize = 1;

/// What the tracker records per allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrackingMode {
    /// Counters and byte totals only.
    #[default]
    Counters = 0,
    /// Counters plus a call stack per live block.
    Verbose = 1,
}

impl TrackingMode {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Verbose,
            _ => Self::Counters,
        }
    }
}

#[repr(C)]
struct AllocationHeader {
    magic: u64,
    /// Size the caller asked for.
    size: usize,
    /// Call stack of the allocation; non-null exactly while the block is in
    /// the live list.
    callstack: *mut CallStack,
    /// Next block in the live list.
    next: *mut AllocationHeader,
    /// Whether the block was counted.
    tracked: bool,
}

const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();
const HEADER_ALIGN: usize = mem::align_of::<AllocationHeader>();

/// Layout handed to the inner allocator for a caller's layout.
struct OuterLayout {
    layout: Layout,
    prefix: usize,
}

impl OuterLayout {
    fn for_user(user: Layout) -> Option<Self> {
        let align = user.align().max(HEADER_ALIGN);
        let prefix = HEADER_SIZE.checked_add(align - 1)? & !(align - 1);
        let size = user.size().checked_add(prefix)?;
        let layout = Layout::from_size_align(size, align).ok()?;
        Some(Self { layout, prefix })
    }
}

/// Header of the block whose user pointer is `user`.
#[inline]
fn header_of(user: *mut u8) -> *mut AllocationHeader {
    user.wrapping_sub(HEADER_SIZE).cast()
}

thread_local! {
    /// Set while the current thread is inside the tracker.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the tracker until dropped.
struct ReentrancyGuard;

impl ReentrancyGuard {
    /// `None` if the thread is already inside, or its thread locals are gone.
    fn enter() -> Option<Self> {
        IN_TRACKER
            .try_with(|inside| {
                if inside.get() {
                    return None;
                }
                inside.set(true);
                Some(Self)
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_TRACKER.try_with(|inside| inside.set(false));
    }
}

/// Runs `f` with tracking suspended on the current thread.
///
/// Blocks allocated inside `f` are never counted, not even when they are
/// freed later. Nested calls are fine.
pub fn with_untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = ReentrancyGuard::enter();
    f()
}

/// Counters and live list, guarded by the tracker's mutex.
struct TrackerState {
    live_count: usize,
    frame_allocs: usize,
    frame_frees: usize,
    live_bytes: usize,
    count_high_water: usize,
    bytes_high_water: usize,
    largest_allocation: usize,
    budget_bytes: Option<u64>,
    recorded: usize,
    head: *mut AllocationHeader,
    tail: *mut AllocationHeader,
}

// SAFETY: the raw pointers are only dereferenced under the tracker's lock.
unsafe impl Send for TrackerState {}

impl TrackerState {
    const fn new() -> Self {
        Self {
            live_count: 0,
            frame_allocs: 0,
            frame_frees: 0,
            live_bytes: 0,
            count_high_water: 0,
            bytes_high_water: 0,
            largest_allocation: 0,
            budget_bytes: None,
            recorded: 0,
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn record_alloc(&mut self, size: usize) {
        self.live_count += 1;
        self.frame_allocs += 1;
        self.live_bytes += size;
        self.count_high_water = self.count_high_water.max(self.live_count);
        self.bytes_high_water = self.bytes_high_water.max(self.live_bytes);
        self.largest_allocation = self.largest_allocation.max(size);
    }

    fn record_free(&mut self, size: usize) {
        self.live_count = self.live_count.saturating_sub(1);
        self.frame_frees += 1;
        self.live_bytes = self.live_bytes.saturating_sub(size);
    }

    /// Appends a header at the tail of the live list.
    unsafe fn link(&mut self, header: *mut AllocationHeader) {
        (*header).next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = header;
        } else {
            (*self.tail).next = header;
        }
        self.tail = header;
        self.recorded += 1;
    }

    /// Removes a header from the live list, if present.
    unsafe fn unlink(&mut self, header: *mut AllocationHeader) {
        let mut prev: *mut AllocationHeader = ptr::null_mut();
        let mut node = self.head;
        while !node.is_null() && node != header {
            prev = node;
            node = (*node).next;
        }
        if node.is_null() {
            return;
        }

        let next = (*node).next;
        if prev.is_null() {
            self.head = next;
        } else {
            (*prev).next = next;
        }
        if self.tail == node {
            self.tail = prev;
        }
        (*node).next = ptr::null_mut();
        self.recorded -= 1;
    }

    fn budget_overflow(&self) -> u64 {
        self.budget_bytes
            .map_or(0, |budget| (self.live_bytes as u64).saturating_sub(budget))
    }
}

/// A point-in-time copy of the tracker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    /// Blocks allocated and not yet freed.
    pub live_allocations: usize,
    /// Allocations since the last frame reset.
    pub frame_allocations: usize,
    /// Frees since the last frame reset.
    pub frame_frees: usize,
    /// Bytes currently allocated.
    pub live_bytes: usize,
    /// Highest number of live blocks seen.
    pub count_high_water: usize,
    /// Highest number of live bytes seen.
    pub bytes_high_water: usize,
    /// Largest single allocation seen.
    pub largest_allocation: usize,
    /// Advisory byte budget, if one is set.
    pub budget_bytes: Option<u64>,
    /// Live bytes above the budget.
    pub budget_overflow: u64,
    /// Live blocks that carry a call stack.
    pub recorded_stacks: usize,
}

/// One live allocation copied out of the tracker for reporting.
#[derive(Debug, Clone)]
pub struct LiveRecord {
    /// Where the block was allocated.
    pub callstack: CallStack,
    /// Size the caller asked for.
    pub size: usize,
}

/// Process-wide allocation statistics and the verbose live list.
pub struct AllocationTracker {
    state: Mutex<TrackerState>,
    mode: AtomicU8,
}

impl AllocationTracker {
    /// Creates a tracker in [`TrackingMode::Counters`] with no budget.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: const_mutex(TrackerState::new()),
            mode: AtomicU8::new(TrackingMode::Counters as u8),
        }
    }

    /// Runs `f` on the locked state with tracking suspended, so anything
    /// the lock allocates while parking is passed through untracked.
    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        with_untracked(|| f(&mut self.state.lock()))
    }

    /// Current tracking mode.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> TrackingMode {
        TrackingMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Switches the tracking mode. Blocks allocated earlier keep what they
    /// recorded.
    pub fn set_mode(&self, mode: TrackingMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Blocks allocated and not yet freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.with_state(|state| state.live_count)
    }

    /// Allocations since the last [`reset_frame`](Self::reset_frame).
    #[must_use]
    pub fn frame_allocations(&self) -> usize {
        self.with_state(|state| state.frame_allocs)
    }

    /// Frees since the last [`reset_frame`](Self::reset_frame).
    #[must_use]
    pub fn frame_frees(&self) -> usize {
        self.with_state(|state| state.frame_frees)
    }

    /// Bytes currently allocated, excluding tracking headers.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.with_state(|state| state.live_bytes)
    }

    /// Highest number of simultaneously live blocks.
    #[must_use]
    pub fn count_high_water(&self) -> usize {
        self.with_state(|state| state.count_high_water)
    }

    /// Highest number of simultaneously live bytes.
    #[must_use]
    pub fn bytes_high_water(&self) -> usize {
        self.with_state(|state| state.bytes_high_water)
    }

    /// Largest single allocation seen.
    #[must_use]
    pub fn largest_allocation(&self) -> usize {
        self.with_state(|state| state.largest_allocation)
    }

    /// Advisory budget in bytes.
    #[must_use]
    pub fn budget_bytes(&self) -> Option<u64> {
        self.with_state(|state| state.budget_bytes)
    }

    /// Live bytes above the budget, 0 when under budget or without one.
    #[must_use]
    pub fn budget_overflow(&self) -> u64 {
        self.with_state(|state| state.budget_overflow())
    }

    /// Sets the advisory budget to `amount` of `unit`.
    ///
    /// The budget never blocks an allocation; it only shows up in stats
    /// and reports.
    pub fn set_budget(&self, amount: u64, unit: ByteUnit) {
        self.with_state(|state| state.budget_bytes = Some(unit.to_bytes(amount)));
    }

    /// Sets the advisory budget in bytes.
    pub fn set_budget_bytes(&self, bytes: u64) {
        self.set_budget(bytes, ByteUnit::Bytes);
    }

    /// Sets the advisory budget in KiB.
    pub fn set_budget_kib(&self, kib: u64) {
        self.set_budget(kib, ByteUnit::KiB);
    }

    /// Sets the advisory budget in MiB.
    pub fn set_budget_mib(&self, mib: u64) {
        self.set_budget(mib, ByteUnit::MiB);
    }

    /// Sets the advisory budget in GiB.
    pub fn set_budget_gib(&self, gib: u64) {
        self.set_budget(gib, ByteUnit::GiB);
    }

    /// Removes the budget.
    pub fn clear_budget(&self) {
        self.with_state(|state| state.budget_bytes = None);
    }

    /// Starts a new frame: zeroes the per-frame allocation and free counts.
    pub fn reset_frame(&self) {
        self.with_state(|state| {
            state.frame_allocs = 0;
            state.frame_frees = 0;
        });
    }

    /// Copies every counter at once.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.with_state(|state| TrackerStats {
            live_allocations: state.live_count,
            frame_allocations: state.frame_allocs,
            frame_frees: state.frame_frees,
            live_bytes: state.live_bytes,
            count_high_water: state.count_high_water,
            bytes_high_water: state.bytes_high_water,
            largest_allocation: state.largest_allocation,
            budget_bytes: state.budget_bytes,
            budget_overflow: state.budget_overflow(),
            recorded_stacks: state.recorded,
        })
    }

    /// Copies the live list, oldest allocation first.
    #[must_use]
    pub fn live_records(&self) -> Vec<LiveRecord> {
        self.with_state(|state| {
            let mut records = Vec::with_capacity(state.recorded);
            let mut node = state.head;
            while !node.is_null() {
                // SAFETY: nodes in the live list are headers of unfreed
                // blocks, and the lock keeps them from being unlinked.
                unsafe {
                    let header = &*node;
                    records.push(LiveRecord {
                        callstack: (*header.callstack).clone(),
                        size: header.size,
                    });
                    node = header.next;
                }
            }
            records
        })
    }

    /// Allocates through `inner` and records the block.
    ///
    /// # Safety
    ///
    /// Same contract as [`GlobalAlloc::alloc`]. The block must be released
    /// with [`dealloc_with`](Self::dealloc_with) on this tracker with the
    /// same inner allocator and layout.
    pub unsafe fn alloc_with<A: GlobalAlloc>(
        &self,
        inner: &A,
        layout: Layout,
        zeroed: bool,
    ) -> *mut u8 {
        let Some(outer) = OuterLayout::for_user(layout) else {
            return ptr::null_mut();
        };
        let base = if zeroed {
            inner.alloc_zeroed(outer.layout)
        } else {
            inner.alloc(outer.layout)
        };
        if base.is_null() {
            return base;
        }

        let user = base.add(outer.prefix);
        let header = header_of(user);
        let guard = ReentrancyGuard::enter();
        header.write(AllocationHeader {
            magic: MAGIC_LIVE,
            size: layout.size(),
            callstack: ptr::null_mut(),
            next: ptr::null_mut(),
            tracked: guard.is_some(),
        });

        if guard.is_some() {
            if self.mode() == TrackingMode::Verbose {
                (*header).callstack = Box::into_raw(Box::new(CallStack::capture(CAPTURE_SKIP)));
            }

            let mut state = self.state.lock();
            state.record_alloc(layout.size());
            if !(*header).callstack.is_null() {
                state.link(header);
            }
        }
        user
    }

    /// Validates the header of `ptr`, records the free and releases the
    /// block through `inner`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidFree`] without touching the block when
    /// its header is missing, already freed, or disagrees with `layout`.
    ///
    /// # Safety
    ///
    /// The memory just before `ptr` must be readable for the header's size.
    /// On success, `ptr` must have come from
    /// [`alloc_with`](Self::alloc_with) with the same inner allocator.
    pub unsafe fn try_dealloc_with<A: GlobalAlloc>(
        &self,
        inner: &A,
        ptr: *mut u8,
        layout: Layout,
    ) -> TrackerResult<()> {
        let invalid = |reason: &'static str| TrackerError::InvalidFree {
            address: ptr as usize,
            reason,
        };
        let outer = OuterLayout::for_user(layout).ok_or_else(|| invalid("layout overflows"))?;
        let header = header_of(ptr);

        match ptr::addr_of!((*header).magic).read() {
            MAGIC_LIVE => {}
            MAGIC_FREED => return Err(invalid("double free")),
            _ => return Err(invalid("block was not allocated by the tracker")),
        }
        if (*header).size != layout.size() {
            return Err(invalid("layout size does not match the allocation"));
        }
        (*header).magic = MAGIC_FREED;

        if (*header).tracked {
            let _guard = ReentrancyGuard::enter();
            let callstack = {
                let mut state = self.state.lock();
                state.record_free(layout.size());
                if !(*header).callstack.is_null() {
                    state.unlink(header);
                }
                mem::replace(&mut (*header).callstack, ptr::null_mut())
            };
            if !callstack.is_null() {
                drop(Box::from_raw(callstack));
            }
        }

        inner.dealloc(ptr.sub(outer.prefix), outer.layout);
        Ok(())
    }

    /// Releases a block allocated by [`alloc_with`](Self::alloc_with).
    ///
    /// An invalid or double free aborts the process after a diagnostic on
    /// stderr; unwinding out of an allocator is not an option.
    ///
    /// # Safety
    ///
    /// Same contract as [`GlobalAlloc::dealloc`].
    pub unsafe fn dealloc_with<A: GlobalAlloc>(&self, inner: &A, ptr: *mut u8, layout: Layout) {
        if let Err(err) = self.try_dealloc_with(inner, ptr, layout) {
            eprintln!("ember_tracking: fatal: {err}");
            std::process::abort();
        }
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The tracker fed by [`TrackingAllocator`].
pub static GLOBAL_TRACKER: AllocationTracker = AllocationTracker::new();

/// Global allocator shim that records every block in [`GLOBAL_TRACKER`].
///
/// ```ignore
/// use ember_tracking::TrackingAllocator;
///
/// #[global_allocator]
/// static ALLOC: TrackingAllocator = TrackingAllocator::system();
/// ```
#[derive(Debug, Default)]
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    /// Wraps the system allocator.
    #[must_use]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: blocks come from the inner allocator with room for a header in
// front; the user pointer keeps the requested alignment.
unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        GLOBAL_TRACKER.alloc_with(&self.inner, layout, false)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        GLOBAL_TRACKER.alloc_with(&self.inner, layout, true)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        GLOBAL_TRACKER.dealloc_with(&self.inner, ptr, layout);
    }
}
