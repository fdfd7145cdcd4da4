//! Synchronization primitives.
//!
//! The kernel is single-threaded and cooperative; the only real
//! concurrency is against interrupt handlers on the same CPU, so most
//! shared state is guarded by [`without_interrupts`] sections, with
//! [`SpinLock`] covering the structures that secondary CPUs could touch
//! once they do more than halt.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};

use crate::arch::x86_64::instructions;

/// Runs `f` with interrupts disabled, restoring the previous interrupt
/// flag afterwards.
///
/// Nested use is fine: the flag is only re-enabled by the outermost call.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let were_enabled = instructions::interrupts_enabled();
    instructions::disable_interrupts();
    let result = f();
    if were_enabled {
        instructions::enable_interrupts();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_interrupts_returns_value() {
        // On the host the flag helpers are inert; this exercises the
        // closure plumbing only.
        let value = without_interrupts(|| 41 + 1);
        assert_eq!(value, 42);
    }

    #[test]
    fn without_interrupts_nests() {
        let value = without_interrupts(|| without_interrupts(|| "inner"));
        assert_eq!(value, "inner");
    }
}
