//! # Tracker Configuration
//!
//! Tracking settings loaded from TOML:
//!
//! ```toml
//! mode = "verbose"
//!
//! [budget]
//! amount = 64
//! unit = "MiB"
//!
//! [report]
//! print_long_report = true
//! max_lines = 32
//! unit_selection = "global"
//! ```
//!
//! Every key is optional; missing keys keep their defaults.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::callstack::MAX_FRAMES;
use crate::error::TrackerResult;
use crate::report::ReportOptions;
use crate::tracker::{AllocationTracker, TrackingMode};
use crate::units::{ByteUnit, UnitSelection};

/// Advisory byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    /// Budget size in `unit`s.
    pub amount: u64,
    /// Unit of `amount`.
    #[serde(default)]
    pub unit: ByteUnit,
}

impl BudgetConfig {
    /// Budget in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.unit.to_bytes(self.amount)
    }
}

/// Leak report settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Print every group with its call stack.
    pub print_long_report: bool,
    /// Resolved lines printed per group.
    pub max_lines: usize,
    /// Unit policy for group totals.
    pub unit_selection: UnitSelection,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            print_long_report: true,
            max_lines: MAX_FRAMES,
            unit_selection: UnitSelection::PerValue,
        }
    }
}

impl ReportConfig {
    /// Options for [`LeakReport::write_to`](crate::LeakReport::write_to).
    #[must_use]
    pub fn options(&self) -> ReportOptions {
        ReportOptions {
            long_report: self.print_long_report,
            max_lines: self.max_lines.min(MAX_FRAMES),
            unit_selection: self.unit_selection,
        }
    }
}

/// Complete tracker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// What each allocation records.
    pub mode: TrackingMode,
    /// Optional advisory budget.
    pub budget: Option<BudgetConfig>,
    /// Leak report settings.
    pub report: ReportConfig,
}

impl TrackerConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidConfig`](crate::TrackerError::InvalidConfig)
    /// on malformed TOML, unknown keys, or unknown enum values.
    pub fn from_toml_str(text: &str) -> TrackerResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Io`](crate::TrackerError::Io) if the file
    /// cannot be read, or a parse error as for
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Applies the mode and budget to `tracker`.
    pub fn apply(&self, tracker: &AllocationTracker) {
        tracker.set_mode(self.mode);
        match self.budget {
            Some(budget) => tracker.set_budget(budget.amount, budget.unit),
            None => tracker.clear_budget(),
        }
        info!(
            mode = ?self.mode,
            budget_bytes = ?self.budget.map(|b| b.bytes()),
            "Tracker configuration applied"
        );
    }
}
