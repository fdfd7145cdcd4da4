//! Multiboot2 boot stub.
//!
//! The loader drops us in 32-bit protected mode with the boot
//! information's physical address in EBX. The stub builds the initial
//! page tables — the first 512 GiB identity-mapped with 1 GiB pages,
//! plus the kernel's high-half image mapping — switches to long mode,
//! and calls into the kernel with the boot information pointer.
//!
//! The real-mode trampoline for secondary CPUs also lives here; it is
//! copied below 1 MiB and patched with the live CR3, an entry point,
//! and a stack before the INIT/SIPI dance starts.

#![no_std]
#![no_main]

use core::arch::global_asm;

use talos_core::arch::x86_64::instructions;
use talos_core::kinfo;
use talos_kernel::interrupts::smp;
use talos_mm::temp;

// ---------------------------------------------------------------------------
// Multiboot2 header and 32-bit entry
// ---------------------------------------------------------------------------

global_asm!(
    r#"
.pushsection .multiboot2_header, "a"
.align 8
mb2_header_start:
    .long 0xE85250D6                    # magic
    .long 0                             # architecture: i386 protected mode
    .long mb2_header_end - mb2_header_start
    .long -(0xE85250D6 + 0 + (mb2_header_end - mb2_header_start))
    # end tag
    .word 0
    .word 0
    .long 8
mb2_header_end:
.popsection

.pushsection .boot.data, "aw"
.align 4096
boot_pml4:
    .skip 4096
boot_pdpt_low:
    .skip 4096
boot_pdpt_high:
    .skip 4096
.align 16
boot_stack_bottom:
    .skip 16384
boot_stack_top:
saved_multiboot:
    .long 0
.align 16
boot_gdt:
    .quad 0
    .quad 0x00209A0000000000            # 64-bit code
    .quad 0x0000920000000000            # data
boot_gdt_descriptor:
    .word boot_gdt_descriptor - boot_gdt - 1
    .quad boot_gdt
.popsection

.pushsection .boot.text, "ax"
.code32
.global _start32
_start32:
    cli
    movl %ebx, saved_multiboot

    # PML4[0] -> identity PDPT, PML4[511] -> high-half PDPT.
    movl $boot_pdpt_low, %eax
    orl $0x3, %eax
    movl %eax, boot_pml4
    movl $boot_pdpt_high, %eax
    orl $0x3, %eax
    movl %eax, boot_pml4 + 511 * 8

    # Identity PDPT: 512 present + writable 1 GiB pages.
    movl $boot_pdpt_low, %edi
    movl $0x83, %eax                    # present | writable | huge
    xorl %edx, %edx
    movl $512, %ecx
1:
    movl %eax, (%edi)
    movl %edx, 4(%edi)
    addl $0x40000000, %eax
    adcl $0, %edx
    addl $8, %edi
    loop 1b

    # High-half PDPT: the kernel image's gigabyte (index 510 covers
    # 0xFFFFFFFF80000000) aliases physical 0.
    movl $0x83, boot_pdpt_high + 510 * 8

    # PAE on, CR3 loaded, long mode + no-execute enabled, paging on.
    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4

    movl $boot_pml4, %eax
    movl %eax, %cr3

    movl $0xC0000080, %ecx              # EFER
    rdmsr
    orl $0x900, %eax                    # LME | NXE
    wrmsr

    movl %cr0, %eax
    orl $0x80000001, %eax               # PG | PE
    movl %eax, %cr0

    lgdt boot_gdt_descriptor
    ljmp $0x08, $_start64

.code64
_start64:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    xorw %ax, %ax
    movw %ax, %fs
    movw %ax, %gs

    movq $boot_stack_top, %rsp
    movl saved_multiboot, %edi
    movabsq $boot_main, %rax
    callq *%rax
2:
    cli
    hlt
    jmp 2b
.popsection
"#,
    options(att_syntax)
);

// ---------------------------------------------------------------------------
// Secondary CPU trampoline
// ---------------------------------------------------------------------------

global_asm!(
    r#"
.pushsection .ap_trampoline, "ax"
.set AP_BASE, 0x8000
.code16
.global __ap_trampoline_start
__ap_trampoline_start:
    cli
    cld
    lgdtl AP_BASE + (ap_gdt_descriptor - __ap_trampoline_start)

    movl %cr0, %eax
    orl $0x1, %eax                      # PE
    movl %eax, %cr0
    ljmpl $0x08, $(AP_BASE + (ap_protected - __ap_trampoline_start))

.code32
ap_protected:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    movl %cr4, %eax
    orl $0x20, %eax                     # PAE
    movl %eax, %cr4

    movl AP_BASE + (ap_cr3_slot - __ap_trampoline_start), %eax
    movl %eax, %cr3

    movl $0xC0000080, %ecx              # EFER
    rdmsr
    orl $0x900, %eax                    # LME | NXE
    wrmsr

    movl %cr0, %eax
    orl $0x80000000, %eax               # PG
    movl %eax, %cr0
    ljmpl $0x18, $(AP_BASE + (ap_long - __ap_trampoline_start))

.code64
ap_long:
    movq AP_BASE + (ap_stack_slot - __ap_trampoline_start), %rsp
    movq AP_BASE + (ap_entry_slot - __ap_trampoline_start), %rax
    jmpq *%rax

.align 16
ap_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF            # 32-bit code
    .quad 0x00CF92000000FFFF            # 32-bit data
    .quad 0x00209A0000000000            # 64-bit code
ap_gdt_descriptor:
    .word ap_gdt_descriptor - ap_gdt - 1
    .long AP_BASE + (ap_gdt - __ap_trampoline_start)

.align 8
.global __ap_cr3_slot
__ap_cr3_slot:
ap_cr3_slot:
    .long 0
.align 8
.global __ap_entry_slot
__ap_entry_slot:
ap_entry_slot:
    .quad 0
.global __ap_stack_slot
__ap_stack_slot:
ap_stack_slot:
    .quad 0
.global __ap_trampoline_end
__ap_trampoline_end:
.popsection
"#,
    options(att_syntax)
);

unsafe extern "C" {
    static __ap_trampoline_start: u8;
    static __ap_trampoline_end: u8;
    static __ap_cr3_slot: u8;
    static __ap_entry_slot: u8;
    static __ap_stack_slot: u8;
}

/// Copies the trampoline below 1 MiB and patches its CR3, entry, and
/// stack slots. Must run after the memory system is up (the copy goes
/// through the linear window) and before the SIPI dance.
fn install_ap_trampoline() {
    // SAFETY: the symbols are linker-provided addresses.
    let (start, end, cr3_slot, entry_slot, stack_slot) = unsafe {
        (
            core::ptr::addr_of!(__ap_trampoline_start) as u64,
            core::ptr::addr_of!(__ap_trampoline_end) as u64,
            core::ptr::addr_of!(__ap_cr3_slot) as u64,
            core::ptr::addr_of!(__ap_entry_slot) as u64,
            core::ptr::addr_of!(__ap_stack_slot) as u64,
        )
    };
    let length = (end - start) as usize;

    let destination = temp::kernel_alias(smp::AP_TRAMPOLINE_PHYS);
    // The trampoline sits in the low .boot section: its link address is
    // its physical address, readable through the linear window.
    let source = temp::kernel_alias(start);
    // SAFETY: both aliases are valid and the regions are disjoint.
    unsafe {
        core::ptr::copy_nonoverlapping::<u8>(
            source.as_ptr(),
            destination.as_mut_ptr(),
            length,
        );
    }

    let Some(stack_phys) = talos_kernel::memory::allocate_frames(1) else {
        kinfo!("boot: no frame for the AP stack; skipping SMP");
        return;
    };
    let stack_top = temp::kernel_alias(stack_phys).as_u64() + 4096;

    let patch = |slot: u64| destination.as_u64() + (slot - start);
    // SAFETY: the patch slots are inside the freshly copied page.
    unsafe {
        (patch(cr3_slot) as *mut u32).write_volatile(instructions::read_cr3() as u32);
        (patch(entry_slot) as *mut u64).write_volatile(smp::secondary_cpu_entry as u64);
        (patch(stack_slot) as *mut u64).write_volatile(stack_top);
    }
}

/// Rust-side entry, called by the stub in long mode with the Multiboot2
/// information pointer.
#[unsafe(no_mangle)]
extern "C" fn boot_main(multiboot_ptr: u64) -> ! {
    // SAFETY: called exactly once by the stub, identity map active.
    let context = unsafe { talos_kernel::boot::early_init(multiboot_ptr) };

    // Device drivers bind during PCI enumeration.
    talos_kernel::pci::register_handler(talos_drivers::ahci::pci_probe);

    install_ap_trampoline();

    talos_kernel::boot::late_init(context)
}
