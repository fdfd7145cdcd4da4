//! Interrupt dispatch core.
//!
//! All 256 vectors funnel through one dispatcher. The CPU does not tell
//! a handler which vector fired, so every vector gets its own tiny
//! trampoline whose only job is to supply the number; the trampolines
//! are stamped out by a declarative macro over a const-generic function
//! rather than written out by hand, and the eight vectors that push an
//! error code are marked in a compile-time bit set.
//!
//! The dispatcher looks the vector up in the handler table, invokes the
//! handler if one is installed, and acknowledges the interrupt through
//! the registered end-of-interrupt function — the 8259 driver until the
//! APIC takes over, the local APIC afterwards.

pub mod apic;
pub mod pic;
pub mod smp;

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use talos_core::arch::x86_64::idt::InterruptStackFrame;
use talos_core::kfatal;
use talos_core::sync::without_interrupts;

/// Vectors for which the CPU pushes an error code: double fault (8),
/// invalid TSS (10), segment not present (11), stack fault (12), general
/// protection (13), page fault (14), alignment check (17), and control
/// protection (21).
pub const ERROR_CODE_VECTORS: u64 = (1 << 8)
    | (1 << 10)
    | (1 << 11)
    | (1 << 12)
    | (1 << 13)
    | (1 << 14)
    | (1 << 17)
    | (1 << 21);

/// The page-fault vector.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Returns `true` if the CPU pushes an error code for `vector`.
#[must_use]
pub const fn pushes_error_code(vector: u8) -> bool {
    vector < 64 && (ERROR_CODE_VECTORS >> vector) & 1 == 1
}

/// Everything a handler learns about the interrupt it is servicing.
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    /// The vector that fired.
    pub vector: u8,
    /// The pushed error code, or 0.
    pub error_code: u64,
    /// Whether `error_code` was actually pushed by the CPU.
    pub has_error_code: bool,
    /// Address of the CPU-pushed `(rip, cs, rflags, rsp, ss)` frame.
    pub frame_pointer: u64,
}

impl InterruptContext {
    /// The interrupted instruction pointer, read from the stack frame.
    #[must_use]
    pub fn instruction_pointer(&self) -> u64 {
        // SAFETY: frame_pointer addresses the CPU-pushed frame for the
        // duration of the handler.
        unsafe { (*(self.frame_pointer as *const InterruptStackFrame)).instruction_pointer.as_u64() }
    }
}

/// An installed interrupt handler.
pub type InterruptHandler = fn(&InterruptContext);

/// Per-gate installation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    /// Allow `int` from ring 3 (gate DPL 3).
    pub user_callable: bool,
    /// Interrupt-stack-table slot, 0 = none.
    pub ist: u8,
}

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

/// Handler per vector, stored as a raw function address (0 = none) so
/// the dispatcher can read it without taking a lock.
static HANDLERS: [AtomicU64; 256] = {
    const NONE: AtomicU64 = AtomicU64::new(0);
    [NONE; 256]
};

// ---------------------------------------------------------------------------
// End-of-interrupt hook
// ---------------------------------------------------------------------------

fn no_eoi(_vector: u8) {}

static EOI_FN: AtomicPtr<()> = AtomicPtr::new(no_eoi as fn(u8) as *mut ());

/// Registers the end-of-interrupt function. The boot sequence installs
/// the 8259 acknowledge here; the APIC mode switch replaces it.
pub fn set_eoi_fn(f: fn(u8)) {
    EOI_FN.store(f as *mut (), Ordering::Release);
}

/// Acknowledges `vector` through the registered function.
pub fn send_eoi(vector: u8) {
    let ptr = EOI_FN.load(Ordering::Acquire);
    // SAFETY: only valid `fn(u8)` pointers are stored in EOI_FN.
    let f: fn(u8) = unsafe { core::mem::transmute(ptr) };
    f(vector);
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Central dispatcher: every trampoline lands here.
///
/// Looks up and invokes the handler for `vector`, then delivers the
/// end-of-interrupt. An unhandled CPU exception (vector below 32) is
/// fatal; an unhandled hardware or software vector is acknowledged and
/// dropped.
pub fn dispatch(vector: u8, frame_pointer: u64, error_code: u64, has_error_code: bool) {
    let raw = HANDLERS[vector as usize].load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: only valid `InterruptHandler` values are stored in
        // HANDLERS.
        let handler: InterruptHandler = unsafe { core::mem::transmute(raw as usize) };
        let context = InterruptContext {
            vector,
            error_code,
            has_error_code,
            frame_pointer,
        };
        handler(&context);
    } else if vector < 32 {
        kfatal!(
            "unhandled exception {} (error code {:#x})",
            vector,
            error_code
        );
        talos_core::arch::x86_64::instructions::halt_loop();
    }

    send_eoi(vector);
}

/// Installs (or with `None`, removes) the handler for `vector`.
///
/// The handler-table store and the gate update happen with interrupts
/// disabled so a concurrent interrupt never sees the pair half-updated.
pub fn set_handler(vector: u8, handler: Option<InterruptHandler>, options: HandlerOptions) {
    without_interrupts(|| {
        let raw = handler.map_or(0, |f| f as usize as u64);
        HANDLERS[vector as usize].store(raw, Ordering::Release);

        #[cfg(target_os = "none")]
        table::update_gate(vector, handler.is_some(), options);
        #[cfg(not(target_os = "none"))]
        let _ = options;
    });
}

/// Logs an unhandled-but-routed interrupt. Installed for every vector at
/// boot so stray interrupts are visible rather than silent.
#[cfg(target_os = "none")]
fn log_stray(context: &InterruptContext) {
    talos_core::kwarn!(
        "stray interrupt {} at {:#x}",
        context.vector,
        context.instruction_pointer()
    );
}

// ---------------------------------------------------------------------------
// IDT and trampolines (kernel target only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod table {
    use super::{HandlerOptions, InterruptStackFrame, dispatch, pushes_error_code};
    use core::cell::UnsafeCell;
    use talos_core::arch::x86_64::idt::{IdtGate, load_idt};
    use talos_core::arch::x86_64::instructions::read_cs;

    /// A plain-vector trampoline: the CPU pushed no error code.
    extern "x86-interrupt" fn plain<const V: u8>(frame: InterruptStackFrame) {
        dispatch(V, core::ptr::from_ref(&frame) as u64, 0, false);
    }

    /// An error-code trampoline for the vectors in
    /// [`super::ERROR_CODE_VECTORS`].
    extern "x86-interrupt" fn with_error<const V: u8>(frame: InterruptStackFrame, error: u64) {
        dispatch(V, core::ptr::from_ref(&frame) as u64, error, true);
    }

    /// One entry of the trampoline table.
    #[derive(Clone, Copy)]
    enum Trampoline {
        Plain(extern "x86-interrupt" fn(InterruptStackFrame)),
        WithError(extern "x86-interrupt" fn(InterruptStackFrame, u64)),
    }

    impl Trampoline {
        fn address(self) -> u64 {
            match self {
                Self::Plain(f) => f as u64,
                Self::WithError(f) => f as u64,
            }
        }
    }

    /// Selects the right trampoline shape for vector `V` at compile
    /// time.
    const fn entry<const V: u8>() -> Trampoline {
        if pushes_error_code(V) {
            Trampoline::WithError(with_error::<V>)
        } else {
            Trampoline::Plain(plain::<V>)
        }
    }

    macro_rules! vector_rows {
        ($($v:literal),+ $(,)?) => {
            [ $( entry::<$v>() ),+ ]
        };
    }

    /// One trampoline per vector, generated over `0..=255`.
    #[rustfmt::skip]
    static TRAMPOLINES: [Trampoline; 256] = vector_rows![
          0,   1,   2,   3,   4,   5,   6,   7,   8,   9,  10,  11,  12,  13,  14,  15,
         16,  17,  18,  19,  20,  21,  22,  23,  24,  25,  26,  27,  28,  29,  30,  31,
         32,  33,  34,  35,  36,  37,  38,  39,  40,  41,  42,  43,  44,  45,  46,  47,
         48,  49,  50,  51,  52,  53,  54,  55,  56,  57,  58,  59,  60,  61,  62,  63,
         64,  65,  66,  67,  68,  69,  70,  71,  72,  73,  74,  75,  76,  77,  78,  79,
         80,  81,  82,  83,  84,  85,  86,  87,  88,  89,  90,  91,  92,  93,  94,  95,
         96,  97,  98,  99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111,
        112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127,
        128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141, 142, 143,
        144, 145, 146, 147, 148, 149, 150, 151, 152, 153, 154, 155, 156, 157, 158, 159,
        160, 161, 162, 163, 164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175,
        176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 189, 190, 191,
        192, 193, 194, 195, 196, 197, 198, 199, 200, 201, 202, 203, 204, 205, 206, 207,
        208, 209, 210, 211, 212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222, 223,
        224, 225, 226, 227, 228, 229, 230, 231, 232, 233, 234, 235, 236, 237, 238, 239,
        240, 241, 242, 243, 244, 245, 246, 247, 248, 249, 250, 251, 252, 253, 254, 255,
    ];

    /// The table itself: 256 gates, one page, page-aligned.
    #[repr(C, align(4096))]
    struct IdtTable([IdtGate; 256]);

    const _: () = assert!(core::mem::size_of::<IdtTable>() == 4096);

    struct IdtCell(UnsafeCell<IdtTable>);

    // SAFETY: mutated only inside `without_interrupts` sections on the
    // bootstrap CPU.
    unsafe impl Sync for IdtCell {}

    static IDT: IdtCell = IdtCell(UnsafeCell::new(IdtTable([IdtGate::missing(); 256])));

    /// Builds every gate and loads the table.
    ///
    /// # Safety
    ///
    /// Must run once, with interrupts disabled, on the bootstrap CPU.
    pub(super) unsafe fn init() {
        let selector = read_cs();
        // SAFETY: single-threaded boot, interrupts disabled.
        let idt = unsafe { &mut *IDT.0.get() };
        for (vector, trampoline) in TRAMPOLINES.iter().enumerate() {
            idt.0[vector] = IdtGate::new(trampoline.address(), selector, 0, 3);
        }
        // SAFETY: IDT is a static; the gates point at static
        // trampolines.
        unsafe {
            let table: &'static [IdtGate; 256] = &(*IDT.0.get()).0;
            load_idt(table);
        }
    }

    /// Rewrites one gate's presence and options.
    pub(super) fn update_gate(vector: u8, present: bool, options: HandlerOptions) {
        let address = TRAMPOLINES[vector as usize].address();
        let dpl = if options.user_callable { 3 } else { 0 };
        let gate = if present {
            IdtGate::new(address, read_cs(), options.ist, dpl)
        } else {
            IdtGate::missing()
        };
        // SAFETY: caller (`set_handler`) runs inside without_interrupts;
        // the store is confined to one 16-byte gate.
        unsafe { (*IDT.0.get()).0[vector as usize] = gate };
    }
}

/// Builds the IDT, loads it, remaps and masks the legacy PICs, and
/// arms the stray-interrupt logger on every vector.
///
/// # Safety
///
/// Must run once, early in boot, on the bootstrap CPU.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    without_interrupts(|| {
        // SAFETY: forwarded contract.
        unsafe { table::init() };
        pic::init();
        set_eoi_fn(pic::send_eoi);
    });

    for vector in 0..=255u8 {
        set_handler(vector, Some(log_stray), HandlerOptions::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static SEEN: Mutex<Vec<(u8, u64, bool)>> = Mutex::new(Vec::new());
    static EOIS: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn record(context: &InterruptContext) {
        SEEN.lock()
            .unwrap()
            .push((context.vector, context.error_code, context.has_error_code));
    }

    fn record_eoi(vector: u8) {
        EOIS.lock().unwrap().push(vector);
    }

    #[test]
    fn error_code_vector_set() {
        for vector in [8u8, 10, 11, 12, 13, 14, 17, 21] {
            assert!(pushes_error_code(vector), "vector {vector}");
        }
        for vector in [0u8, 3, 9, 15, 16, 32, 0x42, 255] {
            assert!(!pushes_error_code(vector), "vector {vector}");
        }
    }

    #[test]
    fn dispatch_invokes_handler_then_eoi() {
        set_handler(0x42, Some(record), HandlerOptions::default());
        set_eoi_fn(record_eoi);

        dispatch(0x42, 0, 0, false);
        dispatch(0x42, 0, 0, false);

        let seen = SEEN.lock().unwrap();
        let ours: Vec<_> = seen.iter().filter(|(v, _, _)| *v == 0x42).collect();
        assert_eq!(ours.len(), 2, "handler runs exactly once per dispatch");
        assert_eq!(*ours[0], (0x42, 0, false));
        drop(seen);

        let eois = EOIS.lock().unwrap();
        assert_eq!(eois.iter().filter(|&&v| v == 0x42).count(), 2);
        drop(eois);

        set_handler(0x42, None, HandlerOptions::default());
    }

    #[test]
    fn dispatch_passes_error_code() {
        set_handler(0x43, Some(record), HandlerOptions::default());
        dispatch(0x43, 0, 0xBAD, true);

        let seen = SEEN.lock().unwrap();
        assert!(seen.contains(&(0x43, 0xBAD, true)));
        drop(seen);
        set_handler(0x43, None, HandlerOptions::default());
    }

    #[test]
    fn unhandled_non_exception_vector_is_dropped() {
        // No handler at 0x99: must neither panic nor halt.
        dispatch(0x99, 0, 0, false);
    }

    #[test]
    fn removed_handler_no_longer_fires() {
        set_handler(0x44, Some(record), HandlerOptions::default());
        set_handler(0x44, None, HandlerOptions::default());
        dispatch(0x44, 0, 0, false);

        let seen = SEEN.lock().unwrap();
        assert!(!seen.iter().any(|(v, _, _)| *v == 0x44));
    }
}
