//! Secondary CPU bring-up.
//!
//! Application processors are woken with the INIT / SIPI handshake and
//! parked: each one runs the real-mode trampoline, reaches long mode,
//! reports in through the rendezvous slot, and halts. Nothing is
//! scheduled on them yet.
//!
//! The rendezvous slot is a single atomic word claimed with
//! compare-exchange: the bootstrap CPU arms it with the target's LAPIC
//! ID before sending the SIPI, the target acknowledges by setting the
//! ack bit, and the bootstrap CPU frees it afterwards. Two CPUs can
//! never mistake each other's hand-off.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use talos_core::{kinfo, kwarn};

use super::apic;
use crate::time;

/// Rendezvous slot states: 0 is free, otherwise [`ARMED`] or [`ACKED`]
/// plus the target LAPIC ID in the low byte.
const SLOT_FREE: u64 = 0;
const ARMED: u64 = 1 << 32;
const ACKED: u64 = 1 << 33;

static RENDEZVOUS: AtomicU64 = AtomicU64::new(SLOT_FREE);

/// Count of secondary CPUs that reported in.
static ONLINE: AtomicU32 = AtomicU32::new(0);

/// How long to wait for a woken CPU to acknowledge.
const ACK_TIMEOUT_MS: u64 = 100;

/// Physical home of the real-mode trampoline. Page aligned, below
/// 1 MiB, clear of the BIOS data area; the memory system reserves it at
/// boot.
pub const AP_TRAMPOLINE_PHYS: u64 = 0x8000;

/// Arms the rendezvous slot for `apic_id`. Fails if the slot is taken,
/// which would mean a previous hand-off never completed.
fn arm_slot(apic_id: u8) -> bool {
    RENDEZVOUS
        .compare_exchange(
            SLOT_FREE,
            ARMED | u64::from(apic_id),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

/// Returns `true` once the armed CPU flipped the slot to acked.
fn slot_acked(apic_id: u8) -> bool {
    RENDEZVOUS.load(Ordering::Acquire) == ACKED | u64::from(apic_id)
}

fn release_slot() {
    RENDEZVOUS.store(SLOT_FREE, Ordering::Release);
}

/// Number of secondary CPUs parked in long mode.
#[must_use]
pub fn online_secondary_cpus() -> u32 {
    ONLINE.load(Ordering::Acquire)
}

/// Entry point for a woken CPU, called by the trampoline once it is in
/// long mode on the kernel page tables. Acknowledges the rendezvous and
/// parks.
#[cfg(target_os = "none")]
pub extern "C" fn secondary_cpu_entry() -> ! {
    let slot = RENDEZVOUS.load(Ordering::Acquire);
    RENDEZVOUS.store(ACKED | (slot & 0xFF), Ordering::Release);
    ONLINE.fetch_add(1, Ordering::AcqRel);
    talos_core::arch::x86_64::instructions::halt_loop();
}

/// Wakes every CPU the MADT lists except the bootstrap one.
///
/// `trampoline_phys` is the physical address of the real-mode start
/// code; it must be page aligned and below 1 MiB because the SIPI vector
/// is its frame number.
pub fn start_secondary_cpus(trampoline_phys: u64) {
    if trampoline_phys % 4096 != 0 || trampoline_phys >= 0x10_0000 {
        kwarn!("SMP: trampoline at {:#x} unusable", trampoline_phys);
        return;
    }
    let sipi_page = (trampoline_phys / 4096) as u8;

    apic::with_controller(|controller| {
        let lapic = controller.local_apic();
        let this_cpu = lapic.id();

        for &target in &controller.topology().cpu_apic_ids {
            if target == this_cpu {
                continue;
            }
            if !arm_slot(target) {
                kwarn!("SMP: rendezvous slot busy, skipping cpu {}", target);
                continue;
            }

            lapic.send_init(target);
            time::sleep_ms(1);
            lapic.send_init_deassert(target);
            time::sleep_ms(1);
            lapic.send_startup(target, sipi_page);

            let mut waited = 0;
            while !slot_acked(target) && waited < ACK_TIMEOUT_MS {
                time::sleep_ms(1);
                waited += 1;
            }
            if slot_acked(target) {
                kinfo!("SMP: cpu {} parked", target);
            } else {
                kwarn!("SMP: cpu {} did not report in", target);
            }
            release_slot();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_handshake() {
        release_slot();
        assert!(arm_slot(3));
        assert!(!arm_slot(4), "an armed slot must not be re-claimed");
        assert!(!slot_acked(3));

        // Simulate the woken CPU's acknowledge.
        let slot = RENDEZVOUS.load(Ordering::Acquire);
        RENDEZVOUS.store(ACKED | (slot & 0xFF), Ordering::Release);

        assert!(slot_acked(3));
        assert!(!slot_acked(4));
        release_slot();
        assert!(arm_slot(4));
        release_slot();
    }
}
