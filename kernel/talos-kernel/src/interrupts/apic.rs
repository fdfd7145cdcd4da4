//! Local APIC and I/O APIC support.
//!
//! The MADT gives us the interrupt topology ([`Topology`]); once it is
//! known the kernel switches from the 8259 pair to APIC mode: the PICs
//! are masked for good, the local APIC is enabled with a spurious vector
//! of 0xFF, every I/O APIC redirection entry starts masked, and
//! end-of-interrupt becomes a single local-APIC register write.
//!
//! Legacy ISA IRQ numbers are translated to Global System Interrupts
//! through the MADT source overrides before any redirection entry is
//! touched.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use talos_acpi::madt::{Madt, MadtEntry};
use talos_core::addr::VirtAddr;
use talos_core::sync::SpinLock;
use talos_core::{kinfo, kwarn};

use super::pic;

// ---------------------------------------------------------------------------
// Local APIC
// ---------------------------------------------------------------------------

const LAPIC_REG_ID: u64 = 0x020;
const LAPIC_REG_EOI: u64 = 0x0B0;
const LAPIC_REG_SVR: u64 = 0x0F0;
const LAPIC_REG_ICR_LOW: u64 = 0x300;
const LAPIC_REG_ICR_HIGH: u64 = 0x310;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;

/// ICR delivery-status (busy) bit.
const ICR_BUSY: u32 = 1 << 12;

/// ICR payloads for the startup handshake.
const ICR_INIT_ASSERT: u32 = 0x4500;
const ICR_INIT_DEASSERT: u32 = 0x8500;
const ICR_STARTUP: u32 = 0x4600;

/// Bound on ICR busy-bit polling.
const ICR_SPIN_TIMEOUT: u32 = 1_000_000;

/// The per-CPU interrupt controller, reached over MMIO.
#[derive(Clone, Copy)]
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// Wraps the local APIC register block mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be a live mapping of the local APIC page.
    #[must_use]
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    /// This CPU's APIC ID.
    #[must_use]
    pub fn id(&self) -> u8 {
        ((self.read(LAPIC_REG_ID) >> 24) & 0xFF) as u8
    }

    /// Software-enables the APIC with the given spurious vector.
    pub fn enable(&self, spurious_vector: u8) {
        self.write(LAPIC_REG_SVR, SVR_ENABLE | u32::from(spurious_vector));
    }

    /// Acknowledges the in-service interrupt.
    pub fn eoi(&self) {
        self.write(LAPIC_REG_EOI, 0);
    }

    /// Sends INIT to `target`.
    pub fn send_init(&self, target: u8) {
        self.send_ipi_raw(target, ICR_INIT_ASSERT);
    }

    /// Sends the INIT de-assert that ends the INIT handshake.
    pub fn send_init_deassert(&self, target: u8) {
        self.send_ipi_raw(target, ICR_INIT_DEASSERT);
    }

    /// Sends a STARTUP IPI; `page` is the real-mode start frame number.
    pub fn send_startup(&self, target: u8, page: u8) {
        self.send_ipi_raw(target, ICR_STARTUP | u32::from(page));
    }

    fn send_ipi_raw(&self, target: u8, low: u32) {
        self.write(LAPIC_REG_ICR_HIGH, u32::from(target) << 24);
        self.write(LAPIC_REG_ICR_LOW, low);
        for _ in 0..ICR_SPIN_TIMEOUT {
            if self.read(LAPIC_REG_ICR_LOW) & ICR_BUSY == 0 {
                return;
            }
            core::hint::spin_loop();
        }
        kwarn!("APIC: IPI to {} stuck in delivery", target);
    }

    fn read(&self, reg: u64) -> u32 {
        // SAFETY: `new` requires a live mapping; registers are 16-byte
        // spaced within one page.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + reg) as *const u32) }
    }

    fn write(&self, reg: u64, value: u32) {
        // SAFETY: same as `read`.
        unsafe { core::ptr::write_volatile((self.base.as_u64() + reg) as *mut u32, value) };
    }
}

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

const IOAPIC_IOREGSEL: u64 = 0x00;
const IOAPIC_IOWIN: u64 = 0x10;

const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REG_REDIR_BASE: u32 = 0x10;

/// Redirection-entry mask bit (low dword).
const REDIR_MASKED: u32 = 1 << 16;

/// Builds the two dwords of a redirection entry: fixed delivery,
/// physical destination, edge triggered, active high.
#[must_use]
pub fn encode_redirection(vector: u8, destination: u8, masked: bool) -> (u32, u32) {
    let mut low = u32::from(vector);
    if masked {
        low |= REDIR_MASKED;
    }
    (low, u32::from(destination) << 24)
}

/// One I/O APIC, reached through its indirect register pair.
pub struct IoApic {
    base: VirtAddr,
    gsi_base: u32,
    entry_count: u32,
}

impl IoApic {
    /// Wraps the I/O APIC mapped at `base`, serving GSIs starting at
    /// `gsi_base`. Reads the redirection-entry count from the version
    /// register.
    ///
    /// # Safety
    ///
    /// `base` must be a live mapping of the I/O APIC register window.
    #[must_use]
    pub unsafe fn new(base: VirtAddr, gsi_base: u32) -> Self {
        let mut ioapic = Self {
            base,
            gsi_base,
            entry_count: 0,
        };
        ioapic.entry_count = ((ioapic.read(IOAPIC_REG_VER) >> 16) & 0xFF) + 1;
        ioapic
    }

    /// First GSI this I/O APIC serves.
    #[must_use]
    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    /// Number of redirection entries.
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Returns `true` if `gsi` falls in this I/O APIC's range.
    #[must_use]
    pub fn serves(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.entry_count
    }

    /// Programs the redirection entry for `gsi`.
    pub fn set_redirection(&self, gsi: u32, vector: u8, destination: u8, masked: bool) {
        let index = gsi - self.gsi_base;
        let (low, high) = encode_redirection(vector, destination, masked);
        self.write(IOAPIC_REG_REDIR_BASE + 2 * index + 1, high);
        self.write(IOAPIC_REG_REDIR_BASE + 2 * index, low);
    }

    /// Reads the low dword of the redirection entry for `gsi`.
    #[must_use]
    pub fn redirection_low(&self, gsi: u32) -> u32 {
        self.read(IOAPIC_REG_REDIR_BASE + 2 * (gsi - self.gsi_base))
    }

    /// Sets or clears only the mask bit of `gsi`'s entry.
    pub fn set_masked(&self, gsi: u32, masked: bool) {
        let reg = IOAPIC_REG_REDIR_BASE + 2 * (gsi - self.gsi_base);
        let low = self.read(reg);
        let low = if masked {
            low | REDIR_MASKED
        } else {
            low & !REDIR_MASKED
        };
        self.write(reg, low);
    }

    /// Masks every redirection entry.
    pub fn mask_all(&self) {
        for index in 0..self.entry_count {
            self.set_masked(self.gsi_base + index, true);
        }
    }

    fn read(&self, reg: u32) -> u32 {
        // SAFETY: `new` requires a live mapping; IOREGSEL/IOWIN form the
        // indirect access pair.
        unsafe {
            core::ptr::write_volatile((self.base.as_u64() + IOAPIC_IOREGSEL) as *mut u32, reg);
            core::ptr::read_volatile((self.base.as_u64() + IOAPIC_IOWIN) as *const u32)
        }
    }

    fn write(&self, reg: u32, value: u32) {
        // SAFETY: same as `read`.
        unsafe {
            core::ptr::write_volatile((self.base.as_u64() + IOAPIC_IOREGSEL) as *mut u32, reg);
            core::ptr::write_volatile((self.base.as_u64() + IOAPIC_IOWIN) as *mut u32, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Topology from the MADT
// ---------------------------------------------------------------------------

/// One I/O APIC as described by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicDescription {
    /// The I/O APIC ID.
    pub id: u8,
    /// Physical address of its register window.
    pub address: u32,
    /// First GSI it serves.
    pub gsi_base: u32,
}

/// The interrupt topology parsed out of the MADT.
#[derive(Debug, Default)]
pub struct Topology {
    /// Physical address of the local APIC register block.
    pub local_apic_address: u64,
    /// LAPIC IDs of all enabled processors.
    pub cpu_apic_ids: Vec<u8>,
    /// All I/O APICs.
    pub io_apics: Vec<IoApicDescription>,
    /// ISA-IRQ to GSI overrides as `(source, gsi)`.
    pub source_overrides: Vec<(u8, u32)>,
}

impl Topology {
    /// Collects the topology from a parsed MADT.
    #[must_use]
    pub fn from_madt(madt: &Madt<'_>) -> Self {
        let mut topology = Self {
            local_apic_address: u64::from(madt.local_apic_address),
            ..Self::default()
        };
        for entry in madt.entries() {
            match entry {
                MadtEntry::LocalApic(cpu) if cpu.enabled() => {
                    topology.cpu_apic_ids.push(cpu.apic_id);
                }
                MadtEntry::IoApic(io) => topology.io_apics.push(IoApicDescription {
                    id: io.id,
                    address: io.address,
                    gsi_base: io.gsi_base,
                }),
                MadtEntry::SourceOverride(ovr) => {
                    topology.source_overrides.push((ovr.source, ovr.gsi));
                }
                _ => {}
            }
        }
        topology
    }

    /// Translates an ISA IRQ to its GSI: the override when one exists,
    /// the identity otherwise.
    #[must_use]
    pub fn resolve_isa_irq(&self, irq: u8) -> u32 {
        self.source_overrides
            .iter()
            .find(|(source, _)| *source == irq)
            .map_or(u32::from(irq), |(_, gsi)| *gsi)
    }

    /// Number of processors.
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpu_apic_ids.len()
    }
}

// ---------------------------------------------------------------------------
// Mode controller
// ---------------------------------------------------------------------------

/// How an IRQ number passed to the routing functions is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// A legacy ISA IRQ number, subject to source overrides.
    Isa,
    /// A Global System Interrupt number, used as is.
    Gsi,
}

/// Live APIC-mode state.
pub struct ApicController {
    lapic: LocalApic,
    io_apics: Vec<IoApic>,
    topology: Topology,
}

static CONTROLLER: SpinLock<Option<ApicController>> = SpinLock::new(None);

/// Lock-free copy of the local APIC base for the EOI fast path.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

impl ApicController {
    fn resolve(&self, source: IrqSource, irq: u8) -> u32 {
        match source {
            IrqSource::Isa => self.topology.resolve_isa_irq(irq),
            IrqSource::Gsi => u32::from(irq),
        }
    }

    fn io_apic_for(&self, gsi: u32) -> Option<&IoApic> {
        self.io_apics.iter().find(|io| io.serves(gsi))
    }
}

/// Switches interrupt routing from the 8259 pair to the APICs.
///
/// Masks the PICs permanently, enables the local APIC with spurious
/// vector 0xFF, and leaves every I/O APIC redirection entry masked. The
/// end-of-interrupt path switches to the local APIC.
///
/// # Safety
///
/// `lapic_virt` and each `io_apic_virt` must be live MMIO mappings of
/// the blocks the topology describes, and interrupts for the masked
/// lines must be quiesced.
pub unsafe fn switch_to_apic_mode(
    topology: Topology,
    lapic_virt: VirtAddr,
    io_apic_virts: &[VirtAddr],
) {
    pic::disable();

    // SAFETY: caller provides a live LAPIC mapping.
    let lapic = unsafe { LocalApic::new(lapic_virt) };
    lapic.enable(0xFF);

    let mut io_apics = Vec::new();
    for (description, &virt) in topology.io_apics.iter().zip(io_apic_virts) {
        // SAFETY: caller provides live I/O APIC mappings.
        let io_apic = unsafe { IoApic::new(virt, description.gsi_base) };
        io_apic.mask_all();
        io_apics.push(io_apic);
    }

    kinfo!(
        "APIC: {} cpus, {} io-apics, {} overrides",
        topology.cpu_count(),
        io_apics.len(),
        topology.source_overrides.len()
    );

    LAPIC_BASE.store(lapic_virt.as_u64(), Ordering::Release);
    super::set_eoi_fn(send_eoi);

    let mut controller = CONTROLLER.lock();
    *controller = Some(ApicController {
        lapic,
        io_apics,
        topology,
    });
}

/// Returns `true` once APIC mode is active.
#[must_use]
pub fn active() -> bool {
    LAPIC_BASE.load(Ordering::Acquire) != 0
}

/// Acknowledges an interrupt in APIC mode. The vector is irrelevant to
/// the local APIC.
pub fn send_eoi(_vector: u8) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base != 0 {
        // SAFETY: LAPIC_BASE holds the live mapping installed by
        // `switch_to_apic_mode`.
        unsafe { LocalApic::new(VirtAddr::new(base)) }.eoi();
    }
}

/// Programs one I/O APIC redirection: `irq` (interpreted per `source`)
/// raises `vector` on the CPU with LAPIC ID `cpu`, edge triggered and
/// unmasked.
pub fn setup_hardware_interrupt(source: IrqSource, irq: u8, vector: u8, cpu: u8) {
    let controller = CONTROLLER.lock();
    let Some(controller) = controller.as_ref() else {
        kwarn!("APIC: routing requested before APIC mode");
        return;
    };
    let gsi = controller.resolve(source, irq);
    match controller.io_apic_for(gsi) {
        Some(io_apic) => io_apic.set_redirection(gsi, vector, cpu, false),
        None => kwarn!("APIC: no io-apic serves gsi {}", gsi),
    }
}

/// The inverse lookup: which vector does `irq` currently raise?
///
/// In APIC mode this reads the programmed redirection entry; before the
/// switch it falls back to the PIC's remap offset. Returns 0 for
/// unroutable lines.
#[must_use]
pub fn hardware_to_vector(source: IrqSource, irq: u8) -> u8 {
    let controller = CONTROLLER.lock();
    if let Some(controller) = controller.as_ref() {
        let gsi = controller.resolve(source, irq);
        return controller
            .io_apic_for(gsi)
            .map_or(0, |io| (io.redirection_low(gsi) & 0xFF) as u8);
    }
    drop(controller);

    if source == IrqSource::Isa {
        return pic::line_vector(irq).unwrap_or(0);
    }
    0
}

/// Returns `true` if the line behind `irq` is currently unmasked, in
/// whichever mode is active.
#[must_use]
pub fn hardware_interrupt_enabled(source: IrqSource, irq: u8) -> bool {
    let controller = CONTROLLER.lock();
    if let Some(controller) = controller.as_ref() {
        let gsi = controller.resolve(source, irq);
        return controller
            .io_apic_for(gsi)
            .is_some_and(|io| io.redirection_low(gsi) & REDIR_MASKED == 0);
    }
    drop(controller);

    source == IrqSource::Isa && pic::line_enabled(irq)
}

/// Masks or unmasks the line behind `irq`, in whichever mode is active.
pub fn set_hardware_interrupt_enabled(source: IrqSource, irq: u8, enabled: bool) {
    let controller = CONTROLLER.lock();
    if let Some(controller) = controller.as_ref() {
        let gsi = controller.resolve(source, irq);
        if let Some(io_apic) = controller.io_apic_for(gsi) {
            io_apic.set_masked(gsi, !enabled);
        }
        return;
    }
    drop(controller);

    if source == IrqSource::Isa {
        pic::set_line_enabled(irq, enabled);
    }
}

/// Runs `f` against the live controller, if APIC mode is up.
pub fn with_controller<R>(f: impl FnOnce(&ApicController) -> R) -> Option<R> {
    let controller = CONTROLLER.lock();
    controller.as_ref().map(f)
}

impl ApicController {
    /// The bootstrap CPU's local APIC.
    #[must_use]
    pub fn local_apic(&self) -> &LocalApic {
        &self.lapic
    }

    /// The parsed topology.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_acpi::AcpiHandler;

    #[test]
    fn redirection_encoding() {
        let (low, high) = encode_redirection(0x60, 2, false);
        assert_eq!(low, 0x60);
        assert_eq!(high, 2 << 24);

        let (low, _) = encode_redirection(0x60, 0, true);
        assert_eq!(low & REDIR_MASKED, REDIR_MASKED);
    }

    struct BufferHandler(Vec<u8>);

    impl AcpiHandler for BufferHandler {
        unsafe fn map_physical_region(&self, phys: u64, _size: usize) -> *const u8 {
            self.0[phys as usize..].as_ptr()
        }
    }

    fn build_madt() -> Vec<u8> {
        // Header (36) + lapic addr + flags, then entries: two CPUs, one
        // I/O APIC at GSI 0, override IRQ0 -> GSI2.
        let mut body = Vec::new();
        body.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        body.extend_from_slice(&[0, 8, 1, 1, 1, 0, 0, 0]);
        body.extend_from_slice(&[1, 12, 0, 0]);
        body.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&[2, 10, 0, 0]);
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());

        let mut table = vec![0u8; 36];
        table[..4].copy_from_slice(b"APIC");
        let total = (36 + body.len()) as u32;
        table[4..8].copy_from_slice(&total.to_le_bytes());
        table.extend_from_slice(&body);
        let sum: u8 = table.iter().fold(0u8, |s, &b| s.wrapping_add(b));
        table[9] = 0u8.wrapping_sub(sum);
        table
    }

    #[test]
    fn topology_from_madt() {
        let handler = BufferHandler(build_madt());
        let madt = Madt::parse(&handler, 0).unwrap();
        let topology = Topology::from_madt(&madt);

        assert_eq!(topology.local_apic_address, 0xFEE0_0000);
        assert_eq!(topology.cpu_apic_ids, vec![0, 1]);
        assert_eq!(
            topology.io_apics,
            vec![IoApicDescription {
                id: 0,
                address: 0xFEC0_0000,
                gsi_base: 0,
            }]
        );
        assert_eq!(topology.source_overrides, vec![(0, 2)]);
    }

    #[test]
    fn isa_irq_resolution_honors_overrides() {
        let topology = Topology {
            source_overrides: vec![(0, 2), (9, 20)],
            ..Topology::default()
        };
        assert_eq!(topology.resolve_isa_irq(0), 2);
        assert_eq!(topology.resolve_isa_irq(9), 20);
        assert_eq!(topology.resolve_isa_irq(4), 4);
    }
}
