//! Sleeping.
//!
//! Once the HPET is up, sleeps spin on its main counter; before that a
//! calibration-free pause loop stands in, which is only ever hit by the
//! earliest boot paths. Sleeps are capped at one second — nothing in the
//! kernel legitimately waits longer.

use crate::hpet;

/// Upper bound on any single sleep.
const MAX_SLEEP_NS: u64 = 1_000_000_000;

/// Fallback pause iterations per microsecond, deliberately generous.
const FALLBACK_SPINS_PER_US: u64 = 1_000;

/// Sleeps for `ns` nanoseconds (capped at one second).
pub fn sleep_ns(ns: u64) {
    let ns = ns.min(MAX_SLEEP_NS);
    let used_hpet = hpet::with_hpet(|hpet| hpet.busy_wait_ns(ns)).is_some();
    if !used_hpet {
        for _ in 0..(ns / 1_000).max(1) * FALLBACK_SPINS_PER_US {
            core::hint::spin_loop();
        }
    }
}

/// Sleeps for `ms` milliseconds (capped at one second).
pub fn sleep_ms(ms: u64) {
    sleep_ns(ms.saturating_mul(1_000_000));
}
