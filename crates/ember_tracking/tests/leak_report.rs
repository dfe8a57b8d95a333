//! # Leak Report Tests
//!
//! These tests drive a private verbose tracker from real call sites:
//!
//! 1. **Grouping**: blocks from one call site share a group, largest group first
//! 2. **Idempotence**: reporting twice prints the same text
//! 3. **Frees**: freed blocks disappear from the next report
//! 4. **Time window**: only blocks captured inside the window are grouped
//!
//! Run with: cargo test -p ember_tracking --test leak_report

#![allow(unsafe_code)]

use std::alloc::{Layout, System};
use std::time::Duration;

use ember_tracking::{
    clock, AllocationTracker, CallStackLine, FrameResolver, ReportOptions, ReportWindow,
    TrackingMode,
};

/// Prints each frame as its address.
struct AddressResolver;

impl FrameResolver for AddressResolver {
    fn resolve(&self, address: usize) -> Option<CallStackLine> {
        Some(CallStackLine::without_location(format!("{address:#x}")))
    }
}

fn layout(size: usize) -> Layout {
    Layout::from_size_align(size, 8).unwrap()
}

#[inline(never)]
fn spawn_site(tracker: &AllocationTracker, size: usize) -> *mut u8 {
    unsafe { tracker.alloc_with(&System, layout(size), false) }
}

#[inline(never)]
fn network_site(tracker: &AllocationTracker, size: usize) -> *mut u8 {
    unsafe { tracker.alloc_with(&System, layout(size), false) }
}

fn verbose_tracker() -> AllocationTracker {
    let tracker = AllocationTracker::new();
    tracker.set_mode(TrackingMode::Verbose);
    tracker
}

fn render(tracker: &AllocationTracker, window: ReportWindow) -> String {
    let mut out = Vec::new();
    tracker
        .report_to(&mut out, &AddressResolver, window, &ReportOptions::default())
        .unwrap();
    String::from_utf8(out).unwrap()
}

fn release(tracker: &AllocationTracker, blocks: Vec<(*mut u8, usize)>) {
    for (block, size) in blocks {
        unsafe { tracker.dealloc_with(&System, block, layout(size)) };
    }
}

#[test]
fn groups_follow_call_sites() {
    let tracker = verbose_tracker();
    let mut blocks = Vec::new();
    for size in [10, 20] {
        blocks.push((spawn_site(&tracker, size), size));
    }
    blocks.push((network_site(&tracker, 5), 5));

    let report = tracker.leak_report(ReportWindow::ENTIRE);
    let groups: Vec<_> = report
        .groups()
        .iter()
        .map(|g| (g.count(), g.total_bytes()))
        .collect();
    assert_eq!(groups, [(2, 30), (1, 5)]);
    assert_ne!(report.groups()[0].hash(), report.groups()[1].hash());
    assert_eq!(report.leaked_allocations(), 3);
    assert_eq!(report.leaked_bytes(), 35);

    let text = render(&tracker, ReportWindow::ENTIRE);
    assert!(text.starts_with("3 leaked allocation(s).  Total: 35.000 B\n"));
    let first = text.find("Group contained 2 allocation(s), Total: 30.000 B").unwrap();
    let second = text.find("Group contained 1 allocation(s), Total: 5.000 B").unwrap();
    assert!(first < second);

    release(&tracker, blocks);
}

#[test]
fn reporting_is_idempotent() {
    let tracker = verbose_tracker();
    let blocks: Vec<_> = [64, 128, 256]
        .into_iter()
        .map(|size| (spawn_site(&tracker, size), size))
        .collect();

    let before = tracker.stats();
    let first = render(&tracker, ReportWindow::ENTIRE);
    let second = render(&tracker, ReportWindow::ENTIRE);
    assert_eq!(first, second);
    assert_eq!(tracker.stats(), before);

    release(&tracker, blocks);
}

#[test]
fn freed_blocks_leave_the_report() {
    let tracker = verbose_tracker();
    let mut blocks: Vec<_> = [100, 200]
        .into_iter()
        .map(|size| (spawn_site(&tracker, size), size))
        .collect();
    let last = (network_site(&tracker, 7), 7);

    release(&tracker, vec![last]);
    let report = tracker.leak_report(ReportWindow::ENTIRE);
    assert_eq!(report.groups().len(), 1);
    assert_eq!(report.groups()[0].total_bytes(), 300);

    let kept = blocks.pop().unwrap();
    release(&tracker, blocks);
    let report = tracker.leak_report(ReportWindow::ENTIRE);
    assert_eq!(report.groups()[0].count(), 1);

    release(&tracker, vec![kept]);
    assert!(tracker.leak_report(ReportWindow::ENTIRE).groups().is_empty());
    assert_eq!(tracker.live_allocations(), 0);
}

#[test]
fn window_selects_capture_times() {
    let tracker = verbose_tracker();
    let early = (spawn_site(&tracker, 40), 40);
    std::thread::sleep(Duration::from_millis(20));
    let cutoff = clock::now_seconds();
    std::thread::sleep(Duration::from_millis(20));
    let late = (network_site(&tracker, 8), 8);

    let report = tracker.leak_report(ReportWindow {
        start: Some(cutoff),
        end: None,
    });
    assert_eq!(report.groups().len(), 1);
    assert_eq!(report.groups()[0].total_bytes(), 8);

    let report = tracker.leak_report(ReportWindow::between(0.0, cutoff));
    assert_eq!(report.groups().len(), 1);
    assert_eq!(report.groups()[0].total_bytes(), 40);

    release(&tracker, vec![early, late]);
}
