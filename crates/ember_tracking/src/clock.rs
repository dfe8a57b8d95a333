//! # Clock
//!
//! Process-relative timestamps for call stacks and report windows.

use std::sync::OnceLock;
use std::time::Instant;

/// Instant of the first clock query in this process.
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the first clock query of the process.
///
/// Never allocates, so it is safe to call from inside the allocation hooks.
#[inline]
#[must_use]
pub fn now_seconds() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let first = now_seconds();
        let second = now_seconds();
        assert!(first >= 0.0);
        assert!(second >= first);
    }
}
