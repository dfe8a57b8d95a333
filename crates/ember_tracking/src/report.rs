//! # Leak Reports
//!
//! Groups the live call stacks recorded in verbose mode by call site and
//! prints them largest first:
//!
//! ```text
//! 3 leaked allocation(s).  Total: 35.000 B
//!
//! Group contained 2 allocation(s), Total: 30.000 B
//!      src/world.rs(42): ember_game::world::spawn
//!      src/main.rs(10): ember_game::main
//!
//! Group contained 1 allocation(s), Total: 5.000 B
//!      src/net.rs(7): ember_game::net::connect
//! ```
//!
//! Building a report never changes the tracker, so the same state always
//! produces the same text.

use std::io::{self, Write};

use tracing::{debug, warn};

use crate::callstack::{CallStack, FrameResolver, MAX_FRAMES};
use crate::clock;
use crate::error::TrackerResult;
use crate::tracker::{with_untracked, AllocationTracker, LiveRecord, TrackerStats};
use crate::units::{ByteUnit, ReadableBytes, UnitSelection};

/// Slack applied to both ends of a report window.
pub const WINDOW_EPSILON: f64 = 1e-5;

/// Capture-time range of the allocations a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReportWindow {
    /// Earliest capture time, or the start of the process.
    pub start: Option<f64>,
    /// Latest capture time, or the moment the report is built.
    pub end: Option<f64>,
}

impl ReportWindow {
    /// Every recorded allocation.
    pub const ENTIRE: Self = Self {
        start: None,
        end: None,
    };

    /// Allocations captured between `start` and `end` seconds.
    #[must_use]
    pub const fn between(start: f64, end: f64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    fn contains(&self, time: f64, now: f64) -> bool {
        let start = self.start.unwrap_or(0.0);
        let end = self.end.unwrap_or(now);
        time >= start - WINDOW_EPSILON && time <= end + WINDOW_EPSILON
    }
}

/// Rendering options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    /// Print groups and their call stacks, not only the summary line.
    pub long_report: bool,
    /// Resolved lines printed per group.
    pub max_lines: usize,
    /// How group totals choose their unit.
    pub unit_selection: UnitSelection,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            long_report: true,
            max_lines: MAX_FRAMES,
            unit_selection: UnitSelection::PerValue,
        }
    }
}

/// Live allocations that share one call stack.
#[derive(Debug, Clone)]
pub struct LeakGroup {
    callstack: CallStack,
    count: usize,
    total_bytes: u64,
}

impl LeakGroup {
    /// Hash shared by every allocation in the group.
    #[inline]
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.callstack.hash()
    }

    /// Number of allocations.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Sum of the allocation sizes.
    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Call stack of the oldest allocation in the group.
    #[inline]
    #[must_use]
    pub fn callstack(&self) -> &CallStack {
        &self.callstack
    }
}

/// A grouped view of the tracker's live allocations.
#[derive(Debug, Clone)]
pub struct LeakReport {
    leaked_allocations: usize,
    leaked_bytes: u64,
    budget_bytes: Option<u64>,
    budget_overflow: u64,
    groups: Vec<LeakGroup>,
}

impl LeakReport {
    /// Groups `records` by call-stack hash.
    ///
    /// Records outside `window` are dropped first. Groups are ordered by
    /// total size, largest first; groups of equal size keep ascending hash
    /// order. The summary line uses the totals from `stats`.
    #[must_use]
    pub fn build(stats: &TrackerStats, records: &[LiveRecord], window: ReportWindow) -> Self {
        let now = clock::now_seconds();
        let mut kept: Vec<&LiveRecord> = records
            .iter()
            .filter(|record| window.contains(record.callstack.time(), now))
            .collect();
        kept.sort_by_key(|record| record.callstack.hash());

        let mut groups: Vec<LeakGroup> = Vec::new();
        for record in kept {
            match groups.last_mut() {
                Some(group) if group.hash() == record.callstack.hash() => {
                    group.count += 1;
                    group.total_bytes += record.size as u64;
                }
                _ => groups.push(LeakGroup {
                    callstack: record.callstack.clone(),
                    count: 1,
                    total_bytes: record.size as u64,
                }),
            }
        }
        groups.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));

        Self {
            leaked_allocations: stats.live_allocations,
            leaked_bytes: stats.live_bytes as u64,
            budget_bytes: stats.budget_bytes,
            budget_overflow: stats.budget_overflow,
            groups,
        }
    }

    /// Live allocations when the report was built.
    #[must_use]
    pub fn leaked_allocations(&self) -> usize {
        self.leaked_allocations
    }

    /// Live bytes when the report was built.
    #[must_use]
    pub fn leaked_bytes(&self) -> u64 {
        self.leaked_bytes
    }

    /// Groups, largest first.
    #[must_use]
    pub fn groups(&self) -> &[LeakGroup] {
        &self.groups
    }

    /// Renders the report.
    ///
    /// # Errors
    ///
    /// Returns any error from `out`.
    pub fn write_to<W, R>(&self, out: &mut W, resolver: &R, options: &ReportOptions) -> io::Result<()>
    where
        W: Write + ?Sized,
        R: FrameResolver + ?Sized,
    {
        writeln!(
            out,
            "{} leaked allocation(s).  Total: {}",
            self.leaked_allocations,
            ReadableBytes::new(self.leaked_bytes)
        )?;

        if let Some(budget) = self.budget_bytes.filter(|_| self.budget_overflow > 0) {
            writeln!(
                out,
                "Budget of {} exceeded by {}",
                ReadableBytes::new(budget),
                ReadableBytes::new(self.budget_overflow)
            )?;
        }

        if !options.long_report {
            return Ok(());
        }

        let report_unit = ByteUnit::for_bytes(self.leaked_bytes);
        for group in &self.groups {
            let total = match options.unit_selection {
                UnitSelection::PerValue => ReadableBytes::new(group.total_bytes),
                UnitSelection::Global => ReadableBytes::in_unit(group.total_bytes, report_unit),
            };
            writeln!(out)?;
            writeln!(out, "Group contained {} allocation(s), Total: {total}", group.count)?;
            for line in group.callstack.lines(resolver, options.max_lines) {
                writeln!(out, "     {line}")?;
            }
        }
        Ok(())
    }
}

impl AllocationTracker {
    /// Groups the live verbose allocations captured inside `window`.
    #[must_use]
    pub fn leak_report(&self, window: ReportWindow) -> LeakReport {
        with_untracked(|| LeakReport::build(&self.stats(), &self.live_records(), window))
    }

    /// Builds a leak report and renders it into `out`.
    ///
    /// Nothing allocated while reporting is tracked.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Io`](crate::TrackerError::Io) if writing fails.
    pub fn report_to<W, R>(
        &self,
        out: &mut W,
        resolver: &R,
        window: ReportWindow,
        options: &ReportOptions,
    ) -> TrackerResult<()>
    where
        W: Write + ?Sized,
        R: FrameResolver + ?Sized,
    {
        with_untracked(|| {
            let report = self.leak_report(window);
            if report.budget_overflow > 0 {
                warn!(
                    live_bytes = report.leaked_bytes,
                    overflow = report.budget_overflow,
                    "Allocation budget exceeded"
                );
            }
            debug!(
                allocations = report.leaked_allocations,
                bytes = report.leaked_bytes,
                groups = report.groups.len(),
                "Leak report generated"
            );
            report.write_to(out, resolver, options)?;
            Ok(())
        })
    }

    /// Prints the allocations captured between `start` and `end` seconds to
    /// stdout. A missing bound means the start of the process or now.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Io`](crate::TrackerError::Io) if stdout fails.
    pub fn report_verbose_call_stacks<R: FrameResolver + ?Sized>(
        &self,
        resolver: &R,
        start: Option<f64>,
        end: Option<f64>,
        long_report: bool,
    ) -> TrackerResult<()> {
        let options = ReportOptions {
            long_report,
            ..ReportOptions::default()
        };
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.report_to(&mut out, resolver, ReportWindow { start, end }, &options)
    }

    /// Prints every recorded allocation to stdout.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Io`](crate::TrackerError::Io) if stdout fails.
    pub fn report_entire_verbose_call_stack_list<R: FrameResolver + ?Sized>(
        &self,
        resolver: &R,
        long_report: bool,
    ) -> TrackerResult<()> {
        self.report_verbose_call_stacks(resolver, None, None, long_report)
    }
}
