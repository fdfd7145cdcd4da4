//! AHCI SATA engine.
//!
//! Binds any PCI function with class 01.06.01, takes the controller
//! over from firmware (reset plus BIOS/OS handoff), brings up every
//! implemented port, and registers each answering SATA drive with the
//! storage registry. Reads and writes of arbitrary shape are repaired
//! into sector-aligned DMA by the [`rw`] layer.

pub mod command;
pub mod port;
pub mod prdt;
pub mod regs;
pub mod rw;

extern crate alloc;

use alloc::boxed::Box;

use talos_core::addr::VirtAddr;
use talos_core::{kinfo, kwarn};
use talos_kernel::pci::{BarValue, PciDevice};
use talos_kernel::storage::{self, StorageDevice};
use talos_mm::temp;

use port::{AhciPort, DeviceKind};
use regs::{HbaBohc, HbaCap, HbaCap2, HbaGhc};

/// PCI class of a mass-storage controller.
const PCI_CLASS_STORAGE: u8 = 0x01;
/// PCI subclass for SATA.
const PCI_SUBCLASS_SATA: u8 = 0x06;
/// PCI programming interface for AHCI.
const PCI_PROGIF_AHCI: u8 = 0x01;

/// ABAR lives in BAR 5.
const ABAR_INDEX: u8 = 5;

/// Bound for controller-level spins (reset, handoff).
const SPIN_TIMEOUT: u32 = 1_000_000;

/// PCI handler: boot registers this with the enumerator.
pub fn pci_probe(device: &PciDevice) {
    if device.class != PCI_CLASS_STORAGE
        || device.subclass != PCI_SUBCLASS_SATA
        || device.prog_if != PCI_PROGIF_AHCI
    {
        return;
    }

    let Some(BarValue::Memory { phys, .. }) = device.bar(ABAR_INDEX) else {
        kwarn!("AHCI: {:04x}:{:04x} has no memory ABAR", device.vendor_id, device.device_id);
        return;
    };

    kinfo!(
        "AHCI: controller {:04x}:{:04x} at {:02x}:{:02x}.{}",
        device.vendor_id,
        device.device_id,
        device.bus,
        device.device,
        device.function
    );

    device.enable_bus_mastering();
    let abar = temp::kernel_alias(phys);
    // SAFETY: ABAR comes from the device's BAR and is linearly mapped.
    unsafe { init_controller(abar) };
}

/// Brings the controller from firmware hands to a running AHCI host.
///
/// # Safety
///
/// `abar` must be the mapped ABAR of an AHCI controller with bus
/// mastering enabled.
unsafe fn init_controller(abar: VirtAddr) {
    let read = |offset: u64| -> u32 {
        // SAFETY: ABAR is mapped per the caller contract.
        unsafe { core::ptr::read_volatile((abar.as_u64() + offset) as *const u32) }
    };
    let write = |offset: u64, value: u32| {
        // SAFETY: same as `read`.
        unsafe { core::ptr::write_volatile((abar.as_u64() + offset) as *mut u32, value) };
    };

    // Reset with AHCI mode asserted, and wait for HR to self-clear.
    write(regs::HBA_GHC, (HbaGhc::AE | HbaGhc::HR).bits());
    let mut reset_done = false;
    for _ in 0..SPIN_TIMEOUT {
        if read(regs::HBA_GHC) & HbaGhc::HR.bits() == 0 {
            reset_done = true;
            break;
        }
        core::hint::spin_loop();
    }
    if !reset_done {
        kwarn!("AHCI: controller reset stuck; abandoning");
        return;
    }
    write(regs::HBA_GHC, HbaGhc::AE.bits());

    let cap = HbaCap::from_bits_retain(read(regs::HBA_CAP));
    let cap2 = HbaCap2::from_bits_retain(read(regs::HBA_CAP2));
    let ports_implemented = read(regs::HBA_PI);
    let version = read(regs::HBA_VS);

    kinfo!(
        "AHCI: version {}.{}, {} command slots, ports {:#x}",
        version >> 16,
        version & 0xFFFF,
        cap.command_slots(),
        ports_implemented
    );

    // BIOS/OS handoff, where supported and still BIOS-owned.
    if cap2.contains(HbaCap2::BOH) {
        let bohc = HbaBohc::from_bits_retain(read(regs::HBA_BOHC));
        if bohc.contains(HbaBohc::BOS) {
            write(regs::HBA_BOHC, (bohc | HbaBohc::OOS).bits());
            for _ in 0..SPIN_TIMEOUT {
                let bohc = HbaBohc::from_bits_retain(read(regs::HBA_BOHC));
                if bohc & (HbaBohc::BOS | HbaBohc::OOS) == HbaBohc::OOS {
                    break;
                }
                core::hint::spin_loop();
            }
            kinfo!("AHCI: BIOS handoff complete");
        }
    }

    for index in 0..32u8 {
        if ports_implemented & (1 << index) == 0 {
            continue;
        }
        // SAFETY: the port is implemented and ABAR is mapped.
        if let Some(port) = unsafe { AhciPort::init(abar, index, cap.command_slots()) } {
            if port.kind == DeviceKind::Sata && port.identity.sector_count > 0 {
                storage::register_device(Box::new(AhciDisk { port }));
            } else {
                kinfo!("AHCI: port {}: {} left unbound", index, port.kind.name());
            }
        }
    }
}

/// A SATA drive as the storage registry sees it: the alignment-repair
/// layer over one port.
struct AhciDisk {
    port: AhciPort,
}

// SAFETY: the port owns its DMA structures exclusively and the registry
// serializes access.
unsafe impl Send for AhciDisk {}

impl StorageDevice for AhciDisk {
    fn size_bytes(&self) -> u64 {
        self.port.identity.sector_count * self.port.identity.sector_size
    }

    fn read(&mut self, offset: u64, size: u64, buffer: &mut [u8]) -> i64 {
        rw::read(&mut self.port, offset, size, buffer)
    }

    fn write(&mut self, offset: u64, size: u64, buffer: &[u8]) -> i64 {
        rw::write(&mut self.port, offset, size, buffer)
    }

    fn type_name(&self) -> &'static str {
        self.port.kind.name()
    }
}
