//! Thin wrappers over the handful of privileged instructions the kernel
//! needs.
//!
//! Every function has an inert host body so that logic built on top of
//! these (interrupt-flag bracketing, page-table walks) can run under
//! `cargo test`. On the host, interrupts read as disabled and the control
//! registers read as zero.

/// RFLAGS bit 9: interrupt enable.
const RFLAGS_IF: u64 = 1 << 9;

/// Returns `true` if maskable interrupts are enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        let rflags: u64;
        // SAFETY: pushfq/pop only touches the stack slot it allocates.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                out(reg) rflags,
                options(nomem, preserves_flags),
            );
        }
        rflags & RFLAGS_IF != 0
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = RFLAGS_IF;
        false
    }
}

/// Enables maskable interrupts (`sti`).
#[inline]
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    // SAFETY: sti has no memory effects.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Disables maskable interrupts (`cli`).
#[inline]
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    // SAFETY: cli has no memory effects.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Halts the CPU until the next interrupt (`hlt`).
#[inline]
pub fn halt() {
    #[cfg(target_os = "none")]
    // SAFETY: hlt has no memory effects.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Disables interrupts and halts forever. The terminal state for fatal
/// errors.
pub fn halt_loop() -> ! {
    #[cfg(target_os = "none")]
    loop {
        disable_interrupts();
        halt();
    }
    #[cfg(not(target_os = "none"))]
    panic!("halt_loop reached on the host");
}

/// Invalidates the TLB entry for `virt` (`invlpg`).
#[inline]
pub fn invalidate_page(virt: u64) {
    #[cfg(target_os = "none")]
    // SAFETY: invlpg only affects the TLB.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Reads CR3 (the physical address of the live level-4 table, plus flags
/// in the low 12 bits).
#[inline]
#[must_use]
pub fn read_cr3() -> u64 {
    #[cfg(target_os = "none")]
    {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        cr3
    }
    #[cfg(not(target_os = "none"))]
    0
}

/// Reads CR2 (the faulting address after a page fault).
#[inline]
#[must_use]
pub fn read_cr2() -> u64 {
    #[cfg(target_os = "none")]
    {
        let cr2: u64;
        // SAFETY: reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        cr2
    }
    #[cfg(not(target_os = "none"))]
    0
}

/// Raises software interrupt `VECTOR` (`int imm8`).
#[inline]
pub fn software_interrupt<const VECTOR: u8>() {
    #[cfg(target_os = "none")]
    // SAFETY: the IDT must have a gate installed for VECTOR; the dispatch
    // core guarantees that for all 256 vectors.
    unsafe {
        core::arch::asm!("int {}", const VECTOR, options(nomem, nostack));
    }
}

/// Reads the code-segment selector.
#[inline]
#[must_use]
pub fn read_cs() -> u16 {
    #[cfg(target_os = "none")]
    {
        let cs: u16;
        // SAFETY: reading a segment register has no side effects.
        unsafe {
            core::arch::asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
        }
        cs
    }
    #[cfg(not(target_os = "none"))]
    0x08
}
