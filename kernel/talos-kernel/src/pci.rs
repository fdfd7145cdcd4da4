//! PCI enumeration over ECAM.
//!
//! The MCFG table names one or more ECAM windows; each exposes a 4 KiB
//! memory-mapped configuration page per function at
//! `base + (bus << 20) + (device << 15) + (function << 12)`. The
//! enumerator walks a window's start bus, follows PCI-to-PCI bridges
//! into their secondary buses, and hands every discovered function to
//! the registered handlers in registration order.

extern crate alloc;

use alloc::vec::Vec;

use talos_acpi::mcfg::EcamWindow;
use talos_core::addr::VirtAddr;
use talos_core::arch::x86_64::Port;
use talos_core::kinfo;
use talos_core::sync::SpinLock;

/// Configuration-space offsets.
mod config {
    pub const VENDOR_ID: u64 = 0x00;
    pub const DEVICE_ID: u64 = 0x02;
    pub const COMMAND: u64 = 0x04;
    pub const REVISION: u64 = 0x08;
    pub const PROG_IF: u64 = 0x09;
    pub const SUBCLASS: u64 = 0x0A;
    pub const CLASS: u64 = 0x0B;
    pub const HEADER_TYPE: u64 = 0x0E;
    pub const BAR0: u64 = 0x10;
    pub const SECONDARY_BUS: u64 = 0x19;
}

/// COMMAND register bits for memory decode and bus mastering.
const COMMAND_MEMORY_SPACE: u16 = 1 << 1;
const COMMAND_BUS_MASTER: u16 = 1 << 2;

/// An ECAM window plus the virtual address its base is mapped at.
#[derive(Debug, Clone, Copy)]
pub struct EcamRegion {
    /// The window as described by the MCFG.
    pub window: EcamWindow,
    /// Kernel-visible address of `window.base`.
    pub virt_base: VirtAddr,
}

impl EcamRegion {
    /// Virtual address of the configuration page of
    /// `bus:device.function`.
    #[must_use]
    pub fn function_virt(&self, bus: u8, device: u8, function: u8) -> VirtAddr {
        let offset =
            self.window.function_base(bus, device, function) - self.window.base;
        VirtAddr::new(self.virt_base.as_u64() + offset)
    }
}

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    /// Bus number.
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
    /// Virtual address of the function's ECAM page.
    pub config: VirtAddr,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Revision ID.
    pub revision: u8,
    /// Header type byte; bit 7 flags a multi-function device.
    pub header_type: u8,
}

/// A decoded base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarValue {
    /// An I/O port range.
    Io {
        /// First port of the range.
        port: u16,
    },
    /// A memory-mapped range.
    Memory {
        /// Physical base address.
        phys: u64,
        /// Whether the BAR consumed two slots (64-bit).
        is_64bit: bool,
        /// Prefetchable hint.
        prefetchable: bool,
    },
}

impl PciDevice {
    /// Reads one byte of configuration space.
    #[must_use]
    pub fn read8(&self, offset: u64) -> u8 {
        // SAFETY: config points at this function's mapped ECAM page.
        unsafe { core::ptr::read_volatile((self.config.as_u64() + offset) as *const u8) }
    }

    /// Reads a 16-bit configuration word.
    #[must_use]
    pub fn read16(&self, offset: u64) -> u16 {
        // SAFETY: same as `read8`.
        unsafe { core::ptr::read_volatile((self.config.as_u64() + offset) as *const u16) }
    }

    /// Reads a 32-bit configuration dword.
    #[must_use]
    pub fn read32(&self, offset: u64) -> u32 {
        // SAFETY: same as `read8`.
        unsafe { core::ptr::read_volatile((self.config.as_u64() + offset) as *const u32) }
    }

    /// Writes a 16-bit configuration word.
    pub fn write16(&self, offset: u64, value: u16) {
        // SAFETY: same as `read8`; configuration writes are
        // device-visible.
        unsafe { core::ptr::write_volatile((self.config.as_u64() + offset) as *mut u16, value) };
    }

    /// Decodes base address register `index` (0-5).
    ///
    /// A 64-bit memory BAR pulls its upper half from the following
    /// slot. Unimplemented BARs read as zero and decode to `None`.
    #[must_use]
    pub fn bar(&self, index: u8) -> Option<BarValue> {
        if index >= 6 {
            return None;
        }
        let offset = config::BAR0 + u64::from(index) * 4;
        let raw = self.read32(offset);
        if raw == 0 {
            return None;
        }

        if raw & 1 != 0 {
            return Some(BarValue::Io {
                port: (raw & !0x3) as u16,
            });
        }

        let is_64bit = (raw >> 1) & 0x3 == 2;
        let prefetchable = raw & 0x8 != 0;
        let mut phys = u64::from(raw & !0xF);
        if is_64bit && index < 5 {
            phys |= u64::from(self.read32(offset + 4)) << 32;
        }
        Some(BarValue::Memory {
            phys,
            is_64bit,
            prefetchable,
        })
    }

    /// Enables memory decode and bus mastering, for devices about to do
    /// DMA.
    pub fn enable_bus_mastering(&self) {
        let command = self.read16(config::COMMAND);
        self.write16(
            config::COMMAND,
            command | COMMAND_MEMORY_SPACE | COMMAND_BUS_MASTER,
        );
    }
}

/// A BAR made dereferenceable: ports for I/O BARs, a mapped virtual
/// base for memory BARs. All widths dispatch to `in`/`out` or volatile
/// loads and stores accordingly.
#[derive(Debug, Clone, Copy)]
pub enum MappedBar {
    /// An I/O port BAR.
    Io {
        /// First port of the range.
        port: u16,
    },
    /// A memory BAR mapped into the kernel.
    Memory {
        /// Kernel-visible base of the range.
        virt: VirtAddr,
    },
}

impl MappedBar {
    /// Reads a byte at `offset`.
    #[must_use]
    pub fn read8(&self, offset: u64) -> u8 {
        match self {
            // SAFETY: the BAR names a live device register range.
            Self::Io { port } => unsafe { Port::<u8>::new(port + offset as u16).read() },
            // SAFETY: memory BARs are mapped before `MappedBar` exists.
            Self::Memory { virt } => unsafe {
                core::ptr::read_volatile((virt.as_u64() + offset) as *const u8)
            },
        }
    }

    /// Reads a 16-bit word at `offset`.
    #[must_use]
    pub fn read16(&self, offset: u64) -> u16 {
        match self {
            // SAFETY: see `read8`.
            Self::Io { port } => unsafe { Port::<u16>::new(port + offset as u16).read() },
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::read_volatile((virt.as_u64() + offset) as *const u16)
            },
        }
    }

    /// Reads a 32-bit dword at `offset`.
    #[must_use]
    pub fn read32(&self, offset: u64) -> u32 {
        match self {
            // SAFETY: see `read8`.
            Self::Io { port } => unsafe { Port::<u32>::new(port + offset as u16).read() },
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::read_volatile((virt.as_u64() + offset) as *const u32)
            },
        }
    }

    /// Reads a 64-bit qword at `offset` (two dwords on an I/O BAR).
    #[must_use]
    pub fn read64(&self, offset: u64) -> u64 {
        match self {
            Self::Io { .. } => {
                u64::from(self.read32(offset)) | (u64::from(self.read32(offset + 4)) << 32)
            }
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::read_volatile((virt.as_u64() + offset) as *const u64)
            },
        }
    }

    /// Writes a byte at `offset`.
    pub fn write8(&self, offset: u64, value: u8) {
        match self {
            // SAFETY: see `read8`.
            Self::Io { port } => unsafe { Port::<u8>::new(port + offset as u16).write(value) },
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::write_volatile((virt.as_u64() + offset) as *mut u8, value);
            },
        }
    }

    /// Writes a 16-bit word at `offset`.
    pub fn write16(&self, offset: u64, value: u16) {
        match self {
            // SAFETY: see `read8`.
            Self::Io { port } => unsafe { Port::<u16>::new(port + offset as u16).write(value) },
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::write_volatile((virt.as_u64() + offset) as *mut u16, value);
            },
        }
    }

    /// Writes a 32-bit dword at `offset`.
    pub fn write32(&self, offset: u64, value: u32) {
        match self {
            // SAFETY: see `read8`.
            Self::Io { port } => unsafe { Port::<u32>::new(port + offset as u16).write(value) },
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::write_volatile((virt.as_u64() + offset) as *mut u32, value);
            },
        }
    }

    /// Writes a 64-bit qword at `offset` (two dwords on an I/O BAR).
    pub fn write64(&self, offset: u64, value: u64) {
        match self {
            Self::Io { .. } => {
                self.write32(offset, value as u32);
                self.write32(offset + 4, (value >> 32) as u32);
            }
            // SAFETY: see `read8`.
            Self::Memory { virt } => unsafe {
                core::ptr::write_volatile((virt.as_u64() + offset) as *mut u64, value);
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// A device handler; any handler may bind the device.
pub type DeviceHandler = fn(&PciDevice);

static HANDLERS: SpinLock<Vec<DeviceHandler>> = SpinLock::new(Vec::new());

/// Adds `handler` to the list invoked for every discovered function, in
/// registration order.
pub fn register_handler(handler: DeviceHandler) {
    HANDLERS.lock().push(handler);
}

/// Walks `region`'s start bus (recursing into bridges) and reports every
/// function to the registered handlers.
pub fn enumerate(region: &EcamRegion) {
    let handlers = HANDLERS.lock();
    enumerate_bus(region, region.window.start_bus, &handlers);
}

/// Walks `region` and reports every function to `callback` instead of
/// the registered handlers.
pub fn enumerate_with(region: &EcamRegion, callback: &mut dyn FnMut(&PciDevice)) {
    walk_bus(region, region.window.start_bus, callback);
}

fn enumerate_bus(region: &EcamRegion, bus: u8, handlers: &[DeviceHandler]) {
    walk_bus(region, bus, &mut |device| {
        kinfo!(
            "PCI: {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x}.{:02x}",
            device.bus,
            device.device,
            device.function,
            device.vendor_id,
            device.device_id,
            device.class,
            device.subclass,
            device.prog_if
        );
        for handler in handlers {
            handler(device);
        }
    });
}

fn walk_bus(region: &EcamRegion, bus: u8, callback: &mut dyn FnMut(&PciDevice)) {
    if bus < region.window.start_bus || bus > region.window.end_bus {
        return;
    }
    for device in 0..32u8 {
        walk_device(region, bus, device, callback);
    }
}

fn walk_device(region: &EcamRegion, bus: u8, device: u8, callback: &mut dyn FnMut(&PciDevice)) {
    let Some(first) = read_function(region, bus, device, 0) else {
        return;
    };
    let multi_function = first.header_type & 0x80 != 0;
    visit_function(region, &first, callback);

    if multi_function {
        for function in 1..8u8 {
            if let Some(info) = read_function(region, bus, device, function) {
                visit_function(region, &info, callback);
            }
        }
    }
}

fn visit_function(region: &EcamRegion, device: &PciDevice, callback: &mut dyn FnMut(&PciDevice)) {
    // PCI-to-PCI bridges hide a whole bus behind their secondary bus
    // number.
    if device.class == 0x06 && device.subclass == 0x04 {
        let secondary = device.read8(config::SECONDARY_BUS);
        if secondary != 0 {
            walk_bus(region, secondary, callback);
        }
    }
    callback(device);
}

fn read_function(region: &EcamRegion, bus: u8, device: u8, function: u8) -> Option<PciDevice> {
    let config = region.function_virt(bus, device, function);
    let probe = PciDevice {
        bus,
        device,
        function,
        config,
        vendor_id: 0,
        device_id: 0,
        class: 0,
        subclass: 0,
        prog_if: 0,
        revision: 0,
        header_type: 0,
    };
    let vendor_id = probe.read16(config::VENDOR_ID);
    if vendor_id == 0xFFFF {
        return None;
    }

    Some(PciDevice {
        vendor_id,
        device_id: probe.read16(config::DEVICE_ID),
        class: probe.read8(config::CLASS),
        subclass: probe.read8(config::SUBCLASS),
        prog_if: probe.read8(config::PROG_IF),
        revision: probe.read8(config::REVISION),
        header_type: probe.read8(config::HEADER_TYPE),
        ..probe
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_core::align_up;

    /// A fake two-bus ECAM window backed by a buffer.
    struct FakeEcam {
        _buffer: Vec<u8>,
        region: EcamRegion,
    }

    const FUNCTION_PAGE: usize = 4096;

    impl FakeEcam {
        fn new() -> Self {
            // Two buses of 32 devices x 8 functions; vendor 0xFFFF
            // everywhere.
            let size = 2 << 20;
            let buffer = vec![0xFFu8; size + FUNCTION_PAGE];
            let virt = align_up(buffer.as_ptr() as u64, FUNCTION_PAGE as u64);
            let region = EcamRegion {
                window: EcamWindow {
                    base: 0xB000_0000,
                    segment: 0,
                    start_bus: 0,
                    end_bus: 1,
                },
                virt_base: VirtAddr::new(virt),
            };
            Self {
                _buffer: buffer,
                region,
            }
        }

        fn function_bytes(&mut self, bus: u8, device: u8, function: u8) -> *mut u8 {
            self.region.function_virt(bus, device, function).as_mut_ptr()
        }

        fn install(&mut self, bus: u8, device: u8, function: u8, bytes: &[(u64, &[u8])]) {
            let page = self.function_bytes(bus, device, function);
            for (offset, data) in bytes {
                for (i, &b) in data.iter().enumerate() {
                    // SAFETY: within the backing buffer.
                    unsafe { page.add(*offset as usize + i).write(b) };
                }
            }
        }
    }

    fn install_device(ecam: &mut FakeEcam, bus: u8, device: u8, function: u8, class: [u8; 3]) {
        ecam.install(
            bus,
            device,
            function,
            &[
                (0x00, &0x8086u16.to_le_bytes()),
                (0x02, &0x2922u16.to_le_bytes()),
                (0x08, &[0x02, class[2], class[1], class[0]]),
                (0x0E, &[0x00]),
            ],
        );
    }

    #[test]
    fn finds_a_single_function_device() {
        let mut ecam = FakeEcam::new();
        install_device(&mut ecam, 0, 2, 0, [0x01, 0x06, 0x01]);

        let mut found = Vec::new();
        enumerate_with(&ecam.region, &mut |device| {
            found.push((device.bus, device.device, device.function, device.class));
        });

        assert_eq!(found, vec![(0, 2, 0, 0x01)]);
    }

    #[test]
    fn reads_identity_fields() {
        let mut ecam = FakeEcam::new();
        install_device(&mut ecam, 0, 3, 0, [0x01, 0x06, 0x01]);

        let mut seen = None;
        enumerate_with(&ecam.region, &mut |device| seen = Some(*device));
        let device = seen.unwrap();
        assert_eq!(device.vendor_id, 0x8086);
        assert_eq!(device.device_id, 0x2922);
        assert_eq!(device.class, 0x01);
        assert_eq!(device.subclass, 0x06);
        assert_eq!(device.prog_if, 0x01);
        assert_eq!(device.revision, 0x02);
    }

    #[test]
    fn multi_function_devices_visit_all_functions() {
        let mut ecam = FakeEcam::new();
        install_device(&mut ecam, 0, 4, 0, [0x0C, 0x03, 0x00]);
        ecam.install(0, 4, 0, &[(0x0E, &[0x80])]); // multi-function bit
        install_device(&mut ecam, 0, 4, 3, [0x0C, 0x05, 0x00]);

        let mut found = Vec::new();
        enumerate_with(&ecam.region, &mut |device| {
            found.push((device.device, device.function));
        });
        assert_eq!(found, vec![(4, 0), (4, 3)]);
    }

    #[test]
    fn bridges_recurse_into_secondary_bus() {
        let mut ecam = FakeEcam::new();
        // Bridge at 0:1.0 with secondary bus 1; a device behind it.
        install_device(&mut ecam, 0, 1, 0, [0x06, 0x04, 0x00]);
        ecam.install(0, 1, 0, &[(0x19, &[1])]);
        install_device(&mut ecam, 1, 0, 0, [0x01, 0x06, 0x01]);

        let mut found = Vec::new();
        enumerate_with(&ecam.region, &mut |device| {
            found.push((device.bus, device.device));
        });
        // The secondary bus is walked before the bridge is reported.
        assert_eq!(found, vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn bar_decoding() {
        let mut ecam = FakeEcam::new();
        install_device(&mut ecam, 0, 5, 0, [0x01, 0x06, 0x01]);
        // BAR0: I/O at 0x1F0; BAR1: empty; BAR4: 64-bit memory;
        // BAR5 holds its upper half... use BAR2/3 for the 64-bit pair
        // and BAR5 for a 32-bit memory BAR.
        ecam.install(
            0,
            5,
            0,
            &[
                (0x10, &0x0000_01F1u32.to_le_bytes()),
                (0x18, &0xD000_0004u32.to_le_bytes()),
                (0x1C, &0x0000_0001u32.to_le_bytes()),
                (0x24, &0xFEB0_0000u32.to_le_bytes()),
            ],
        );

        let mut seen = None;
        enumerate_with(&ecam.region, &mut |device| seen = Some(*device));
        let device = seen.unwrap();

        assert_eq!(device.bar(0), Some(BarValue::Io { port: 0x1F0 }));
        assert_eq!(device.bar(1), None);
        assert_eq!(
            device.bar(2),
            Some(BarValue::Memory {
                phys: 0x1_D000_0000,
                is_64bit: true,
                prefetchable: false,
            })
        );
        assert_eq!(
            device.bar(5),
            Some(BarValue::Memory {
                phys: 0xFEB0_0000,
                is_64bit: false,
                prefetchable: false,
            })
        );
    }

    #[test]
    fn mapped_memory_bar_accessors() {
        let mut backing = vec![0u8; 64];
        backing[0] = 0xAB;
        backing[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let bar = MappedBar::Memory {
            virt: VirtAddr::new(backing.as_ptr() as u64),
        };

        assert_eq!(bar.read8(0), 0xAB);
        assert_eq!(bar.read32(4), 0xDEAD_BEEF);

        bar.write16(8, 0x1234);
        assert_eq!(bar.read16(8), 0x1234);
        bar.write64(16, 0x0123_4567_89AB_CDEF);
        assert_eq!(bar.read64(16), 0x0123_4567_89AB_CDEF);
    }
}
