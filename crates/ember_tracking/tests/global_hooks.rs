//! # Global Hook Tests
//!
//! This binary installs the tracking allocator for the whole process and
//! verifies that ordinary Rust allocations flow through it:
//!
//! 1. **Counting**: a `Vec` shows up in live bytes and high-water marks
//! 2. **Verbose records**: the block carries a call stack until it is dropped
//! 3. **Untracked scopes**: allocations inside `with_untracked` are invisible
//! 4. **Reports**: symbols resolve to this test's own functions
//! 5. **Idempotent reports**: reporting twice prints the same text and leaves
//!    every counter untouched
//!
//! Everything lives in one test because the harness allocates concurrently.
//!
//! Run with: cargo test -p ember_tracking --test global_hooks

use ember_tracking::{
    with_untracked, ReportOptions, ReportWindow, SymbolSystem, TrackingAllocator, TrackingMode,
    GLOBAL_TRACKER,
};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::system();

/// Sizes no other code in the process is likely to request.
const TRACKED_SIZE: usize = 123_457;
const UNTRACKED_SIZE: usize = 98_765;

fn has_record_of(size: usize) -> bool {
    GLOBAL_TRACKER
        .live_records()
        .iter()
        .any(|record| record.size == size)
}

#[inline(never)]
fn allocate_marker() -> Vec<u8> {
    vec![7u8; TRACKED_SIZE]
}

#[test]
fn process_allocations_are_tracked() {
    GLOBAL_TRACKER.set_mode(TrackingMode::Verbose);
    GLOBAL_TRACKER.reset_frame();

    let marker = allocate_marker();
    let stats = GLOBAL_TRACKER.stats();
    assert!(stats.live_allocations >= 1);
    assert!(stats.live_bytes >= TRACKED_SIZE);
    assert!(stats.bytes_high_water >= TRACKED_SIZE);
    assert!(stats.largest_allocation >= TRACKED_SIZE);
    assert!(stats.frame_allocations >= 1);
    assert!(has_record_of(TRACKED_SIZE));

    let untracked = with_untracked(|| vec![1u8; UNTRACKED_SIZE]);
    assert!(!has_record_of(UNTRACKED_SIZE));

    // Growing goes through realloc, which must keep headers consistent.
    let mut grown: Vec<u64> = Vec::new();
    for i in 0..10_000 {
        grown.push(i);
    }
    assert_eq!(grown.iter().sum::<u64>(), 10_000 * 9_999 / 2);

    let symbols = SymbolSystem::init().unwrap();
    let options = ReportOptions::default();
    let mut first = Vec::new();
    let mut second = Vec::new();

    let before = GLOBAL_TRACKER.stats();
    GLOBAL_TRACKER
        .report_to(&mut first, &symbols, ReportWindow::ENTIRE, &options)
        .unwrap();
    let between = GLOBAL_TRACKER.stats();
    GLOBAL_TRACKER
        .report_to(&mut second, &symbols, ReportWindow::ENTIRE, &options)
        .unwrap();
    let after = GLOBAL_TRACKER.stats();

    assert_eq!(before, between, "first report changed the tracker");
    assert_eq!(between, after, "second report changed the tracker");
    assert_eq!(first, second);

    let text = String::from_utf8(first).unwrap();
    assert!(text.contains("leaked allocation(s).  Total:"));
    assert!(text.contains("Group contained"));
    assert!(text.contains("allocate_marker"));
    drop(symbols);

    drop(marker);
    drop(untracked);
    drop(grown);
    assert!(!has_record_of(TRACKED_SIZE));
    assert!(GLOBAL_TRACKER.frame_frees() >= 1);

    GLOBAL_TRACKER.set_mode(TrackingMode::Counters);
}
