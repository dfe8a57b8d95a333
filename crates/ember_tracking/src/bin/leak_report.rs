//! # Leak Report
//!
//! Demo of verbose tracking: leaks a few blocks from two call sites and
//! prints the grouped report.
//!
//! Usage: `leak_report [config.toml]`

use std::hint::black_box;

use ember_tracking::{
    ReportWindow, SymbolSystem, TrackerConfig, TrackingAllocator, TrackingMode, GLOBAL_TRACKER,
};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::system();

/// Small leaks from one call site.
#[inline(never)]
fn leak_particles(count: usize) {
    for i in 0..count {
        let particle = Box::new([i as f32; 8]);
        std::mem::forget(black_box(particle));
    }
}

/// One large leak from another call site.
#[inline(never)]
fn leak_chunk(bytes: usize) {
    let chunk = vec![0u8; bytes];
    std::mem::forget(black_box(chunk));
}

fn main() {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         EMBER LEAK REPORT                                        ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => match TrackerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                println!("Error: Could not load config {path}: {e}");
                return;
            }
        },
        None => TrackerConfig {
            mode: TrackingMode::Verbose,
            ..TrackerConfig::default()
        },
    };
    config.apply(&GLOBAL_TRACKER);

    let before = GLOBAL_TRACKER.stats();
    leak_particles(16);
    leak_chunk(3 * 1024);
    GLOBAL_TRACKER.reset_frame();

    let after = GLOBAL_TRACKER.stats();
    println!("Mode:                {:?}", GLOBAL_TRACKER.mode());
    println!("Live allocations:    {}", after.live_allocations);
    println!("Leaked this run:     {}", after.live_allocations.saturating_sub(before.live_allocations));
    println!("Live bytes:          {}", after.live_bytes);
    println!("Byte high water:     {}", after.bytes_high_water);
    println!("Largest allocation:  {}", after.largest_allocation);
    println!();

    let symbols = match SymbolSystem::init() {
        Ok(symbols) => symbols,
        Err(e) => {
            println!("Error: {e}");
            return;
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let options = config.report.options();
    if let Err(e) = GLOBAL_TRACKER.report_to(&mut out, &symbols, ReportWindow::ENTIRE, &options) {
        println!("Error: Could not write report: {e}");
    }
}
