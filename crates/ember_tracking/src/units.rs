//! # Byte Units
//!
//! Human-readable byte quantities for reports and budgets.
//!
//! A value switches to the next unit only once it is strictly greater than
//! twice that unit, so 2048 bytes still print as `2048.000 B` and 2049 as
//! `2.001 KiB`.

use std::fmt;

use serde::Deserialize;

/// Bytes in one KiB.
pub const KIB: u64 = 1024;
/// Bytes in one MiB.
pub const MIB: u64 = KIB * 1024;
/// Bytes in one GiB.
pub const GIB: u64 = MIB * 1024;

/// Binary byte unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ByteUnit {
    /// Plain bytes.
    #[default]
    #[serde(rename = "B")]
    Bytes,
    /// 1024 bytes.
    KiB,
    /// 1024 KiB.
    MiB,
    /// 1024 MiB.
    GiB,
}

impl ByteUnit {
    /// Number of bytes in one of this unit.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::KiB => KIB,
            Self::MiB => MIB,
            Self::GiB => GIB,
        }
    }

    /// Suffix printed after a scaled value.
    #[inline]
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Bytes => "B",
            Self::KiB => "KiB",
            Self::MiB => "MiB",
            Self::GiB => "GiB",
        }
    }

    /// Picks the unit a byte count is reported in.
    #[must_use]
    pub const fn for_bytes(bytes: u64) -> Self {
        if bytes > 2 * GIB {
            Self::GiB
        } else if bytes > 2 * MIB {
            Self::MiB
        } else if bytes > 2 * KIB {
            Self::KiB
        } else {
            Self::Bytes
        }
    }

    /// `amount` of this unit in bytes, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn to_bytes(self, amount: u64) -> u64 {
        amount.saturating_mul(self.bytes())
    }

    /// `bytes` expressed in this unit.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scale(self, bytes: u64) -> f64 {
        bytes as f64 / self.bytes() as f64
    }
}

impl fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// How group totals in a leak report pick their unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSelection {
    /// Each value picks its own unit.
    #[default]
    PerValue,
    /// Every value uses the unit chosen for the report's overall total.
    Global,
}

/// A byte count paired with the unit it is displayed in.
///
/// Formats as `<value with three decimals> <unit>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadableBytes {
    bytes: u64,
    unit: ByteUnit,
}

impl ReadableBytes {
    /// Displays `bytes` in the unit it selects for itself.
    #[must_use]
    pub const fn new(bytes: u64) -> Self {
        Self {
            bytes,
            unit: ByteUnit::for_bytes(bytes),
        }
    }

    /// Displays `bytes` in a fixed unit.
    #[must_use]
    pub const fn in_unit(bytes: u64, unit: ByteUnit) -> Self {
        Self { bytes, unit }
    }

    /// Unit used for display.
    #[inline]
    #[must_use]
    pub const fn unit(&self) -> ByteUnit {
        self.unit
    }

    /// Scaled value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> f64 {
        self.unit.scale(self.bytes)
    }
}

impl fmt::Display for ReadableBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} {}", self.value(), self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_are_strict() {
        assert_eq!(ByteUnit::for_bytes(0), ByteUnit::Bytes);
        assert_eq!(ByteUnit::for_bytes(2 * KIB), ByteUnit::Bytes);
        assert_eq!(ByteUnit::for_bytes(2 * KIB + 1), ByteUnit::KiB);
        assert_eq!(ByteUnit::for_bytes(2 * MIB), ByteUnit::KiB);
        assert_eq!(ByteUnit::for_bytes(2 * MIB + 1), ByteUnit::MiB);
        assert_eq!(ByteUnit::for_bytes(2 * GIB + 1), ByteUnit::GiB);
    }

    #[test]
    fn test_readable_formatting() {
        assert_eq!(ReadableBytes::new(30).to_string(), "30.000 B");
        assert_eq!(ReadableBytes::new(3 * KIB).to_string(), "3.000 KiB");
        assert_eq!(ReadableBytes::new(5 * MIB / 2).to_string(), "2.500 MiB");
        assert_eq!(
            ReadableBytes::in_unit(512, ByteUnit::KiB).to_string(),
            "0.500 KiB"
        );
    }

    #[test]
    fn test_budget_units_multiply() {
        assert_eq!(ByteUnit::KiB.to_bytes(4), 4096);
        assert_eq!(ByteUnit::MiB.to_bytes(1), MIB);
        assert_eq!(ByteUnit::GiB.to_bytes(u64::MAX), u64::MAX);
    }
}
