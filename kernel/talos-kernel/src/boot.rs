//! The boot sequence.
//!
//! The boot crate's stub lands in [`early_init`] with the physical
//! address of the Multiboot2 boot information, registers its drivers,
//! and finishes in [`late_init`]. Order matters and is fixed:
//!
//! 1. serial console, so everything after it can log
//! 2. IDT + remapped/masked PICs, so a stray fault reports itself
//! 3. linear window and page tables, then the frame allocator
//! 4. ACPI walk: APIC mode, HPET, ECAM windows
//! 5. PCI enumeration, which hands devices to the registered drivers
//! 6. secondary CPUs, woken and parked
//! 7. the idle loop

use talos_core::arch::x86_64::instructions;
use talos_core::{kfatal, kinfo, kwarn};
use talos_mm::temp;
use talos_multiboot2::{AcpiRoot, BootInfo};

use crate::interrupts::{HandlerOptions, InterruptContext, PAGE_FAULT_VECTOR};
use crate::pci::EcamRegion;
use crate::{acpi, interrupts, memory, pci, serial, storage};

/// A page fault with no owner is fatal: log the faulting address and
/// stop.
fn page_fault(context: &InterruptContext) {
    kfatal!(
        "page fault at {:#x} (error {:#x}, rip {:#x})",
        instructions::read_cr2(),
        context.error_code,
        context.instruction_pointer()
    );
    instructions::halt_loop();
}

/// What `early_init` learned from the boot information and the later
/// stages still need.
pub struct BootContext {
    acpi_root: Option<AcpiRoot>,
}

/// First boot stage: console, interrupts, memory.
///
/// # Safety
///
/// Must be called exactly once by the boot stub, on the bootstrap CPU,
/// with interrupts disabled and the stub's identity map still active.
/// `multiboot_ptr` must be the physical address handed over in `RDI`.
pub unsafe fn early_init(multiboot_ptr: u64) -> BootContext {
    serial::init();
    kinfo!("talos: boot information at {:#x}", multiboot_ptr);

    // SAFETY: single call, boot CPU, per our own contract.
    unsafe { interrupts::init() };
    interrupts::set_handler(
        PAGE_FAULT_VECTOR,
        Some(page_fault),
        HandlerOptions::default(),
    );

    // The boot information sits in low identity-mapped memory, so the
    // physical pointer is directly readable here.
    // SAFETY: the bootloader guarantees a well-formed structure.
    let info = unsafe { BootInfo::from_ptr(multiboot_ptr as *const u8) }
        .expect("multiboot2 boot information unreadable");

    let memory_map = info.memory_map().expect("no memory map tag");
    let acpi_root = info.acpi_root();
    if info.elf_symbols().is_some() {
        kinfo!("talos: ELF symbols present");
    }

    // SAFETY: identity map active, memory map from the bootloader.
    unsafe { memory::init(&memory_map) };

    // The boot information itself lives in allocatable RAM; pin it.
    memory::set_used(multiboot_ptr, info.total_size() as u64);

    BootContext { acpi_root }
}

/// Final boot stage: ACPI, PCI, SMP, then idle. The boot crate calls
/// this after registering device drivers with [`pci::register_handler`].
pub fn late_init(context: BootContext) -> ! {
    match context.acpi_root {
        // SAFETY: the root address comes from the RSDP tag; the
        // interrupt core is up.
        Some(root) => unsafe { acpi::scan(root) },
        None => kwarn!("talos: no RSDP in boot information"),
    }

    instructions::enable_interrupts();

    for window in acpi::ecam_windows() {
        let region = EcamRegion {
            window,
            virt_base: temp::kernel_alias(window.base),
        };
        pci::enumerate(&region);
    }

    kinfo!("talos: {} storage entries", storage::entry_count());

    interrupts::smp::start_secondary_cpus(interrupts::smp::AP_TRAMPOLINE_PHYS);
    kinfo!(
        "talos: {} secondary cpus parked",
        interrupts::smp::online_secondary_cpus()
    );

    kinfo!("talos: idle");
    loop {
        instructions::halt();
    }
}
