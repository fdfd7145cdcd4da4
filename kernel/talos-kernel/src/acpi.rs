//! ACPI table walk.
//!
//! The Multiboot2 RSDP tag names the root table; this module walks its
//! entries and feeds the ones the kernel consumes to their subsystems:
//! `APIC` switches interrupt routing, `MCFG` seeds PCI enumeration,
//! `HPET` starts the timer, and `FACP` contributes a log line. Every
//! table gets a handled/unhandled line so firmware surprises show up in
//! the boot log.

extern crate alloc;

use alloc::vec::Vec;

use talos_acpi::mcfg::{EcamWindow, Mcfg};
use talos_acpi::rsdt::{RootTable, table_signature};
use talos_acpi::{AcpiHandler, fadt, madt};
use talos_core::addr::VirtAddr;
use talos_core::layout::LINEAR_SIZE;
use talos_core::sync::SpinLock;
use talos_core::{kinfo, kwarn};
use talos_mm::temp;
use talos_multiboot2::AcpiRoot;

use crate::interrupts::apic::{self, Topology};

/// Maps physical table memory through the kernel's linear window.
pub struct WindowHandler;

impl AcpiHandler for WindowHandler {
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8 {
        assert!(
            phys + size as u64 <= LINEAR_SIZE,
            "ACPI table beyond the linear window"
        );
        temp::kernel_alias(phys).as_ptr()
    }
}

/// ECAM windows found in the MCFG, kept for PCI enumeration.
static ECAM_WINDOWS: SpinLock<Vec<EcamWindow>> = SpinLock::new(Vec::new());

/// Returns the ECAM windows the MCFG described.
#[must_use]
pub fn ecam_windows() -> Vec<EcamWindow> {
    ECAM_WINDOWS.lock().clone()
}

/// Walks the root table at `root` and dispatches every known table.
///
/// # Safety
///
/// `root` must name a valid RSDT/XSDT reachable through the linear
/// window, and the interrupt core must be initialized (the `APIC` table
/// triggers the APIC mode switch).
pub unsafe fn scan(root: AcpiRoot) {
    let handler = WindowHandler;
    let table = match RootTable::parse(&handler, root.address, root.is_xsdt) {
        Ok(table) => table,
        Err(error) => {
            kwarn!("ACPI: root table rejected: {:?}", error);
            return;
        }
    };

    for phys in table.entries() {
        // SAFETY: entry addresses come from the validated root table.
        let signature = unsafe { table_signature(&handler, phys) };
        let handled = match &signature {
            madt::SIGNATURE => handle_madt(&handler, phys),
            talos_acpi::mcfg::SIGNATURE => handle_mcfg(&handler, phys),
            talos_acpi::hpet::SIGNATURE => handle_hpet(&handler, phys),
            fadt::SIGNATURE => handle_fadt(&handler, phys),
            _ => false,
        };
        kinfo!(
            "ACPI: {} ({})",
            core::str::from_utf8(&signature).unwrap_or("????"),
            if handled { "handled" } else { "unhandled" }
        );
    }
}

fn handle_madt(handler: &WindowHandler, phys: u64) -> bool {
    let Ok(parsed) = madt::Madt::parse(handler, phys) else {
        return false;
    };
    let topology = Topology::from_madt(&parsed);

    let lapic_virt = temp::kernel_alias(topology.local_apic_address);
    let io_apic_virts: Vec<VirtAddr> = topology
        .io_apics
        .iter()
        .map(|io| temp::kernel_alias(u64::from(io.address)))
        .collect();

    // SAFETY: the linear window maps both register blocks; boot has the
    // lines quiesced (everything is still masked).
    unsafe { apic::switch_to_apic_mode(topology, lapic_virt, &io_apic_virts) };
    true
}

fn handle_mcfg(handler: &WindowHandler, phys: u64) -> bool {
    let Ok(parsed) = Mcfg::parse(handler, phys) else {
        return false;
    };
    let mut windows = ECAM_WINDOWS.lock();
    for window in parsed.windows() {
        kinfo!(
            "ACPI: ECAM segment {} buses {}..={} at {:#x}",
            window.segment,
            window.start_bus,
            window.end_bus,
            window.base
        );
        windows.push(window);
    }
    true
}

fn handle_hpet(handler: &WindowHandler, phys: u64) -> bool {
    let Ok(table) = talos_acpi::hpet::parse(handler, phys) else {
        return false;
    };
    // SAFETY: the table's base address comes from firmware.
    unsafe { crate::hpet::init(&table) };
    true
}

fn handle_fadt(handler: &WindowHandler, phys: u64) -> bool {
    let Ok(profile) = fadt::parse(handler, phys) else {
        return false;
    };
    kinfo!("ACPI: preferred power profile: {}", profile.name());
    true
}
