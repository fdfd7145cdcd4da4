//! 8259 PIC driver.
//!
//! The legacy controllers are remapped high (vectors `0xF0..0xFF`, clear
//! of every CPU exception) and fully masked at boot. Until the APIC
//! takes over, individual lines can be unmasked through the cached IMR
//! shadow; afterwards [`disable`] masks everything permanently.

use talos_core::arch::x86_64::Port;
use talos_core::sync::SpinLock;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// ICW1: initialization, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;
/// OCW2: non-specific end of interrupt.
const EOI_CMD: u8 = 0x20;

/// The vector the master PIC is remapped to; the slave follows at +8.
pub const PIC_OFFSET: u8 = 0xF0;

/// Cached controller state: the remap offset and the IMR shadow (one bit
/// per line, set = masked).
struct PicState {
    offset: u8,
    mask: u16,
    active: bool,
}

static STATE: SpinLock<PicState> = SpinLock::new(PicState {
    offset: PIC_OFFSET,
    mask: 0xFFFF,
    active: false,
});

fn write_mask(mask: u16) {
    // SAFETY: the PIC data ports accept IMR writes at any time.
    unsafe {
        Port::<u8>::new(PIC1_DATA).write(mask as u8);
        Port::<u8>::new(PIC2_DATA).write((mask >> 8) as u8);
    }
}

/// Delay by writing the POST diagnostic port; the PICs need a moment
/// between initialization words.
fn io_wait() {
    // SAFETY: port 0x80 is the POST code port; writes are harmless.
    unsafe { Port::<u8>::new(0x80).write(0) };
}

/// Remaps both PICs to [`PIC_OFFSET`] and masks every line.
pub fn init() {
    let mut state = STATE.lock();
    state.mask = 0xFFFF;
    state.active = true;

    write_mask(0xFFFF);

    let pic1_cmd = Port::<u8>::new(PIC1_CMD);
    let pic1_data = Port::<u8>::new(PIC1_DATA);
    let pic2_cmd = Port::<u8>::new(PIC2_CMD);
    let pic2_data = Port::<u8>::new(PIC2_DATA);

    // SAFETY: the ICW sequence below is the architected 8259
    // initialization handshake.
    unsafe {
        pic1_cmd.write(ICW1_INIT);
        io_wait();
        pic2_cmd.write(ICW1_INIT);
        io_wait();

        // ICW2: vector offsets.
        pic1_data.write(state.offset);
        io_wait();
        pic2_data.write(state.offset + 8);
        io_wait();

        // ICW3: slave on line 2, cascade identity 2.
        pic1_data.write(4);
        io_wait();
        pic2_data.write(2);
        io_wait();

        // ICW4: 8086 mode.
        pic1_data.write(ICW4_8086);
        io_wait();
        pic2_data.write(ICW4_8086);
        io_wait();
    }

    write_mask(state.mask);
}

/// Masks every line and retires the controller. Called by the APIC mode
/// switch; afterwards [`line_enabled`] reports everything disabled.
pub fn disable() {
    let mut state = STATE.lock();
    state.mask = 0xFFFF;
    state.active = false;
    write_mask(0xFFFF);
}

/// Masks or unmasks ISA line `irq` (0-15) through the IMR shadow.
pub fn set_line_enabled(irq: u8, enabled: bool) {
    if irq >= 16 {
        return;
    }
    let mut state = STATE.lock();
    if !state.active {
        return;
    }
    if enabled {
        state.mask &= !(1 << irq);
    } else {
        state.mask |= 1 << irq;
    }
    write_mask(state.mask);
}

/// Returns `true` if ISA line `irq` is currently unmasked.
#[must_use]
pub fn line_enabled(irq: u8) -> bool {
    if irq >= 16 {
        return false;
    }
    let state = STATE.lock();
    state.active && state.mask & (1 << irq) == 0
}

/// Returns the vector that ISA line `irq` raises while the PIC is
/// active, or `None` after the APIC took over.
#[must_use]
pub fn line_vector(irq: u8) -> Option<u8> {
    let state = STATE.lock();
    (state.active && irq < 16).then(|| state.offset + irq)
}

/// Acknowledges `vector`: the master always, the slave too when the
/// vector came through it.
pub fn send_eoi(vector: u8) {
    let state = STATE.lock();
    if !state.active || vector < state.offset {
        return;
    }
    // SAFETY: OCW2 writes are valid whenever the PIC is initialized.
    unsafe {
        if vector >= state.offset + 8 {
            Port::<u8>::new(PIC2_CMD).write(EOI_CMD);
        }
        Port::<u8>::new(PIC1_CMD).write(EOI_CMD);
    }
}
