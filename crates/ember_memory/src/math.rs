//! # Power-of-Two Math
//!
//! Small integer helpers shared by the allocators.

/// Rounds `value` up to the next power of two.
///
/// Zero rounds up to one. Returns `None` when the result does not fit in a `usize`.
#[inline]
#[must_use]
pub const fn upper_power_of_two(value: usize) -> Option<usize> {
    if value == 0 {
        return Some(1);
    }
    value.checked_next_power_of_two()
}

/// Floor of the base-2 logarithm. `log2(0)` is defined as zero.
#[inline]
#[must_use]
pub const fn log2(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        value.ilog2() as usize
    }
}

/// Clamps `input` into `[min_value, max_value]`.
#[inline]
#[must_use]
pub fn clamp_within<T: PartialOrd>(input: T, max_value: T, min_value: T) -> T {
    if input < min_value {
        return min_value;
    }
    if input > max_value {
        return max_value;
    }
    input
}

/// Rounds `value` up to a multiple of `align` (which must be a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}
