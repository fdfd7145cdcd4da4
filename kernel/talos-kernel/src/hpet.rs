//! HPET driver.
//!
//! One HPET block drives all kernel timing. Its main counter ticks at a
//! period reported (in femtoseconds) by the capability register; the
//! comparators are programmed one-shot, each wired to hardware interrupt
//! `24 - 1 - index` and routed through the I/O APIC to whatever vector
//! the caller asks for.

use talos_core::addr::VirtAddr;
use talos_core::sync::SpinLock;
use talos_core::{kfatal, kinfo};

use crate::interrupts::apic::{self, IrqSource};

const REG_CAPABILITIES: u64 = 0x000;
const REG_CONFIGURATION: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;

/// Global-configuration enable bit.
const CONFIG_ENABLE: u64 = 1;

/// Comparator-configuration interrupt-enable bit.
const COMPARATOR_INT_ENABLE: u64 = 1 << 2;

/// Comparator-configuration field masks cleared during setup: interrupt
/// enable, periodic bits, and the IRQ routing field.
const COMPARATOR_SETUP_MASK: u64 = 0b11_1111_0000_1110;

/// Femtoseconds per nanosecond.
const FS_PER_NS: u64 = 1_000_000;

/// Byte offset of comparator `index`'s configuration register.
#[must_use]
pub const fn comparator_config_offset(index: u8) -> u64 {
    0x100 + 0x20 * index as u64
}

/// Byte offset of comparator `index`'s value register.
#[must_use]
pub const fn comparator_value_offset(index: u8) -> u64 {
    0x108 + 0x20 * index as u64
}

/// The hardware interrupt line comparator `index` is wired to.
#[must_use]
pub const fn comparator_irq(index: u8) -> u8 {
    24 - 1 - index
}

/// Counter ticks equivalent to `ns` nanoseconds at `period_fs`
/// femtoseconds per tick.
#[must_use]
pub const fn ticks_for_ns(period_fs: u64, ns: u64) -> u64 {
    if period_fs == 0 {
        return 0;
    }
    ns * FS_PER_NS / period_fs
}

/// The HPET block.
#[derive(Clone, Copy)]
pub struct Hpet {
    base: VirtAddr,
    period_fs: u64,
    comparator_count: u8,
}

impl Hpet {
    /// Takes over the HPET mapped at `base`: reads the tick period and
    /// comparator count, disables legacy replacement, routes each
    /// comparator to its interrupt line, and starts the main counter.
    ///
    /// # Safety
    ///
    /// `base` must be a live mapping of the HPET register block.
    #[must_use]
    pub unsafe fn init(base: VirtAddr) -> Self {
        let hpet = Self {
            base,
            period_fs: 0,
            comparator_count: 0,
        };
        let caps = hpet.read(REG_CAPABILITIES);
        let hpet = Self {
            base,
            period_fs: caps >> 32,
            comparator_count: (((caps >> 8) & 0x1F) + 1) as u8,
        };

        kinfo!(
            "HPET: {} comparators, {} ns/tick",
            hpet.comparator_count,
            hpet.period_fs / FS_PER_NS
        );

        // Counter on, legacy replacement off.
        hpet.write(REG_CONFIGURATION, CONFIG_ENABLE);

        for index in 0..hpet.comparator_count {
            let offset = comparator_config_offset(index);
            let mut config = hpet.read(offset);
            config &= !COMPARATOR_SETUP_MASK;
            config |= u64::from(comparator_irq(index)) << 9;
            hpet.write(offset, config);
        }

        hpet
    }

    /// Tick period in femtoseconds.
    #[must_use]
    pub fn period_fs(&self) -> u64 {
        self.period_fs
    }

    /// Current main-counter value.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.read(REG_MAIN_COUNTER)
    }

    /// Arms comparator `index` to fire `vector` once, `ns` nanoseconds
    /// from now, routing its interrupt line through the I/O APIC to the
    /// current CPU.
    pub fn set_timer(&self, ns: u64, index: u8, vector: u8) {
        if index >= self.comparator_count {
            return;
        }

        let cpu = apic::with_controller(|c| c.local_apic().id()).unwrap_or(0);
        apic::setup_hardware_interrupt(IrqSource::Gsi, comparator_irq(index), vector, cpu);

        let target = self.counter() + ticks_for_ns(self.period_fs, ns);
        self.write(comparator_value_offset(index), target);

        let offset = comparator_config_offset(index);
        let config = self.read(offset) | COMPARATOR_INT_ENABLE;
        self.write(offset, config);
    }

    /// Busy-waits for `ns` nanoseconds on the main counter.
    pub fn busy_wait_ns(&self, ns: u64) {
        let ticks = ticks_for_ns(self.period_fs, ns);
        let start = self.counter();
        while self.counter().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }

    fn read(&self, offset: u64) -> u64 {
        // SAFETY: `init` requires a live mapping; all offsets used are
        // inside the register block.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + offset) as *const u64) }
    }

    fn write(&self, offset: u64, value: u64) {
        // SAFETY: same as `read`.
        unsafe { core::ptr::write_volatile((self.base.as_u64() + offset) as *mut u64, value) };
    }
}

static HPET: SpinLock<Option<Hpet>> = SpinLock::new(None);

/// Brings up the HPET described by the ACPI table. A register block
/// outside memory space is unsupported and fatal.
///
/// # Safety
///
/// `table.base_address` must be the HPET's physical MMIO base.
pub unsafe fn init(table: &talos_acpi::hpet::HpetTable) {
    if !table.is_memory_mapped() {
        kfatal!("HPET: register block not in memory space");
        talos_core::arch::x86_64::instructions::halt_loop();
    }
    let base = talos_mm::temp::kernel_alias(table.base_address);
    // SAFETY: the linear window maps the HPET block.
    let hpet = unsafe { Hpet::init(base) };
    let mut global = HPET.lock();
    *global = Some(hpet);
}

/// Runs `f` against the HPET, once it is up.
pub fn with_hpet<R>(f: impl FnOnce(&Hpet) -> R) -> Option<R> {
    let hpet = HPET.lock();
    hpet.as_ref().map(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_wiring() {
        assert_eq!(comparator_irq(0), 23);
        assert_eq!(comparator_irq(1), 22);
        assert_eq!(comparator_irq(7), 16);
    }

    #[test]
    fn register_offsets() {
        assert_eq!(comparator_config_offset(0), 0x100);
        assert_eq!(comparator_value_offset(0), 0x108);
        assert_eq!(comparator_config_offset(2), 0x140);
        assert_eq!(comparator_value_offset(2), 0x148);
    }

    #[test]
    fn tick_conversion() {
        // 10 ns per tick = 10^7 fs per tick.
        assert_eq!(ticks_for_ns(10_000_000, 1_000), 100);
        // 69.84 ns per tick (a common HPET period).
        assert_eq!(ticks_for_ns(69_841_279, 1_000_000), 14318);
        assert_eq!(ticks_for_ns(0, 1_000), 0);
    }
}
