//! # Allocator Contract Tests
//!
//! These tests verify the observable contracts of the block allocators:
//!
//! 1. **Pool exhaustion**: N blocks succeed, the (N+1)-th fails, a free makes room
//! 2. **LIFO reuse**: the most recently freed block is handed out first
//! 3. **Buddy round-trip**: one alloc/free cycle leaves one top-class block
//! 4. **Buddy partial return**: freeing one buddy never merges with a live one
//! 5. **Thread safety**: concurrent allocation never hands out a block twice
//!
//! Run with: cargo test -p ember_memory --test allocator_contracts

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Mutex;

use ember_memory::{BaseAllocator, BuddyAllocator, MemoryError, PoolAllocator};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Particle {
    x: f32,
    y: f32,
    life: f32,
}

const POOL_BLOCKS: usize = 32;

#[test]
fn pool_exhaustion_then_lifo_reuse() {
    let pool: PoolAllocator<Particle> = PoolAllocator::new(POOL_BLOCKS).unwrap();

    let blocks: Vec<NonNull<u8>> = (0..POOL_BLOCKS)
        .map(|_| pool.allocate(pool.block_size()).expect("pool has room"))
        .collect();
    assert_eq!(pool.allocation_count(), POOL_BLOCKS);
    assert_eq!(pool.free_allocation(), 0);
    assert!(pool.allocate(pool.block_size()).is_none());

    let freed = blocks[POOL_BLOCKS / 2];
    unsafe { pool.free(freed, pool.block_size()) };
    assert_eq!(pool.allocate(pool.block_size()), Some(freed));

    for block in blocks {
        unsafe { pool.free(block, pool.block_size()) };
    }
    assert_eq!(pool.allocation_count(), 0);
}

#[test]
fn pool_blocks_are_distinct_and_inside_buffer() {
    let pool: PoolAllocator<Particle> = PoolAllocator::new(POOL_BLOCKS).unwrap();
    let handles: Vec<_> = (0..POOL_BLOCKS)
        .map(|i| {
            let f = i as f32;
            pool.create(Particle { x: f, y: f * 2.0, life: 1.0 }).unwrap()
        })
        .collect();

    let addresses: HashSet<usize> = handles.iter().map(|h| h.block().as_ptr() as usize).collect();
    assert_eq!(addresses.len(), POOL_BLOCKS);
    assert!(handles.iter().all(|h| pool.contains(h.block())));
    assert_eq!(handles[5].x, 5.0);
    assert_eq!(handles[5].y, 10.0);
    assert!(handles.iter().all(|h| h.life == 1.0));

    assert!(matches!(
        pool.create(Particle { x: 0.0, y: 0.0, life: 0.0 }),
        Err(MemoryError::CapacityExhausted { .. })
    ));
}

#[test]
fn buddy_round_trip_leaves_single_top_block() {
    let buddy: BuddyAllocator<[u8; 32]> = BuddyAllocator::new(256).unwrap();
    let top = buddy.top_class();

    for request in [1, 32, 33, 100, 1024, buddy.capacity()] {
        let block = buddy.allocate(request).expect("fresh allocator has room");
        unsafe { buddy.free(block, request) };

        assert_eq!(buddy.free_blocks_in_class(top), 1, "request {request}");
        assert_eq!(buddy.free_bytes(), buddy.capacity(), "request {request}");
    }
}

#[test]
fn buddy_partial_return_keeps_halves_apart() {
    let buddy: BuddyAllocator<[u8; 64]> = BuddyAllocator::new(16).unwrap();
    let class = buddy.size_class_of(64).unwrap();

    let a = buddy.allocate(64).unwrap();
    let b = buddy.allocate(64).unwrap();
    let offset_a = a.as_ptr() as usize - buddy.buffer().as_ptr() as usize;
    let offset_b = b.as_ptr() as usize - buddy.buffer().as_ptr() as usize;
    assert_eq!(offset_a ^ 64, offset_b);

    unsafe { buddy.free(a, 64) };
    assert_eq!(buddy.free_blocks_in_class(class), 1);
    assert_eq!(buddy.allocate(64), Some(a));

    unsafe {
        buddy.free(a, 64);
        buddy.free(b, 64);
    }
    assert_eq!(buddy.free_blocks_in_class(buddy.top_class()), 1);
}

#[test]
fn buddy_rejects_requests_beyond_capacity() {
    let buddy: BuddyAllocator<u64> = BuddyAllocator::new(8).unwrap();
    assert!(buddy.allocate(buddy.capacity() + 1).is_none());
    assert!(matches!(
        buddy.create([0u64; 16]),
        Err(MemoryError::BlockTooLarge { requested: 128, block: 64 })
    ));
}

#[test]
fn concurrent_allocation_never_double_hands_out() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 64;

    let pool: PoolAllocator<u64> = PoolAllocator::new(THREADS * PER_THREAD).unwrap();
    let buddy: BuddyAllocator<u64> = BuddyAllocator::new(THREADS * PER_THREAD).unwrap();
    let seen = Mutex::new(HashSet::new());

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let mut local = Vec::with_capacity(PER_THREAD * 2);
                for _ in 0..PER_THREAD {
                    local.push(pool.allocate(8).unwrap().as_ptr() as usize);
                    local.push(buddy.allocate(8).unwrap().as_ptr() as usize);
                }
                let mut seen = seen.lock().unwrap();
                for addr in local {
                    assert!(seen.insert(addr), "address handed out twice");
                }
            });
        }
    });

    assert_eq!(pool.allocation_count(), THREADS * PER_THREAD);
    assert_eq!(buddy.allocation_count(), THREADS * PER_THREAD);
    assert!(pool.allocate(8).is_none());
    assert!(buddy.allocate(8).is_none());
}
