//! UART 16550 serial console.
//!
//! COM1 is the kernel's log sink from the first milliseconds of boot.
//! Output-only: the kernel never reads the port.

use core::fmt::{self, Write};

use bitflags::bitflags;
use talos_core::arch::x86_64::Port;
use talos_core::log::LogLevel;
use talos_core::sync::SpinLock;

/// COM1 base port.
const COM1: u16 = 0x3F8;

/// Register offsets from the UART base.
mod reg {
    /// Transmit holding register (DLAB=0).
    pub const THR: u16 = 0;
    /// Divisor latch low (DLAB=1).
    pub const DLL: u16 = 0;
    /// Interrupt enable (DLAB=0).
    pub const IER: u16 = 1;
    /// Divisor latch high (DLAB=1).
    pub const DLM: u16 = 1;
    /// FIFO control.
    pub const FCR: u16 = 2;
    /// Line control.
    pub const LCR: u16 = 3;
    /// Modem control.
    pub const MCR: u16 = 4;
    /// Line status.
    pub const LSR: u16 = 5;
}

bitflags! {
    /// Line-status register bits.
    struct Lsr: u8 {
        /// Transmit holding register empty.
        const THR_EMPTY = 1 << 5;
    }
}

/// Divisor for 115200 baud.
const BAUD_DIVISOR: u16 = 1;

/// A 16550-compatible UART at a fixed base port.
pub struct Uart16550 {
    base: u16,
}

impl Uart16550 {
    /// Creates a handle; no I/O happens until [`init`](Self::init).
    #[must_use]
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Programs 115200 baud, 8N1, FIFOs on.
    pub fn init(&self) {
        // SAFETY: architected 16550 initialization writes.
        unsafe {
            Port::<u8>::new(self.base + reg::IER).write(0x00); // no interrupts
            Port::<u8>::new(self.base + reg::LCR).write(0x80); // DLAB on
            Port::<u8>::new(self.base + reg::DLL).write(BAUD_DIVISOR as u8);
            Port::<u8>::new(self.base + reg::DLM).write((BAUD_DIVISOR >> 8) as u8);
            Port::<u8>::new(self.base + reg::LCR).write(0x03); // 8N1, DLAB off
            Port::<u8>::new(self.base + reg::FCR).write(0xC7); // FIFO on, clear, 14-byte trigger
            Port::<u8>::new(self.base + reg::MCR).write(0x0B); // DTR | RTS | OUT2
        }
    }

    /// Writes one byte, spinning (bounded) until the transmitter is
    /// ready.
    pub fn write_byte(&self, byte: u8) {
        // SAFETY: LSR reads and THR writes are always legal on an
        // initialized UART.
        unsafe {
            let lsr = Port::<u8>::new(self.base + reg::LSR);
            for _ in 0..100_000 {
                if Lsr::from_bits_truncate(lsr.read()).contains(Lsr::THR_EMPTY) {
                    break;
                }
                core::hint::spin_loop();
            }
            Port::<u8>::new(self.base + reg::THR).write(byte);
        }
    }
}

impl Write for Uart16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: SpinLock<Uart16550> = SpinLock::new(Uart16550::new(COM1));

fn console_print(args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = console.write_fmt(args);
}

fn console_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = console.write_fmt(format_args!("[{}] {}\n", level.name(), args));
}

/// Initializes COM1 and registers it as both log sinks.
pub fn init() {
    CONSOLE.lock().init();
    // SAFETY: the console sinks only touch the UART ports.
    unsafe {
        talos_core::log::set_print_fn(console_print);
        talos_core::log::set_log_fn(console_log);
    }
}
