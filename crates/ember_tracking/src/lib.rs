//! # EMBER Tracking
//!
//! Process-wide allocation tracking and leak reports.
//!
//! ## Modes
//!
//! 1. **Counters** - live / per-frame counts, byte totals, high-water marks
//! 2. **Verbose** - counters plus a captured call stack per live block
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ember_tracking::{SymbolSystem, TrackingAllocator, TrackingMode, GLOBAL_TRACKER};
//!
//! #[global_allocator]
//! static ALLOC: TrackingAllocator = TrackingAllocator::system();
//!
//! GLOBAL_TRACKER.set_mode(TrackingMode::Verbose);
//! // ... run frames, calling GLOBAL_TRACKER.reset_frame() at each boundary ...
//! let symbols = SymbolSystem::init()?;
//! GLOBAL_TRACKER.report_entire_verbose_call_stack_list(&symbols, true)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod callstack;
pub mod clock;
pub mod config;
pub mod error;
pub mod report;
pub mod tracker;
pub mod units;

pub use callstack::{CallStack, CallStackLine, FrameResolver, SymbolSystem, MAX_FRAMES};
pub use config::{BudgetConfig, ReportConfig, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use report::{LeakGroup, LeakReport, ReportOptions, ReportWindow};
pub use tracker::{
    with_untracked, AllocationTracker, LiveRecord, TrackerStats, TrackingAllocator, TrackingMode,
    GLOBAL_TRACKER,
};
pub use units::{ByteUnit, ReadableBytes, UnitSelection};
