//! AHCI command structures.
//!
//! Packed hardware layouts from the AHCI 1.3.1 specification: the
//! host-to-device register FIS, the 32-byte command header (one per
//! slot), the received-FIS area, and the command table holding the FIS
//! plus the physical region descriptor table.

/// Host-to-device register FIS (20 bytes).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct FisRegH2d {
    /// FIS type, 0x27.
    pub fis_type: u8,
    /// Port multiplier field; bit 7 set = command.
    pub pm_and_c: u8,
    /// ATA command.
    pub command: u8,
    /// Features, low byte.
    pub features_low: u8,

    /// LBA bits 7:0.
    pub lba0: u8,
    /// LBA bits 15:8.
    pub lba1: u8,
    /// LBA bits 23:16.
    pub lba2: u8,
    /// Device register; bit 6 = LBA mode.
    pub device: u8,

    /// LBA bits 31:24.
    pub lba3: u8,
    /// LBA bits 39:32.
    pub lba4: u8,
    /// LBA bits 47:40.
    pub lba5: u8,
    /// Features, high byte.
    pub features_high: u8,

    /// Sector count, low byte.
    pub count_low: u8,
    /// Sector count, high byte.
    pub count_high: u8,
    /// Isochronous command completion.
    pub icc: u8,
    /// Control register.
    pub control: u8,

    /// Reserved.
    pub _reserved: [u8; 4],
}

impl FisRegH2d {
    /// Builds a command FIS for `command` at `lba` with `sector_count`
    /// sectors, LBA mode selected.
    #[must_use]
    pub fn command(command: u8, lba: u64, sector_count: u16) -> Self {
        Self {
            fis_type: super::regs::FIS_TYPE_REG_H2D,
            pm_and_c: 0x80,
            command,
            features_low: 0,
            lba0: lba as u8,
            lba1: (lba >> 8) as u8,
            lba2: (lba >> 16) as u8,
            device: 1 << 6,
            lba3: (lba >> 24) as u8,
            lba4: (lba >> 32) as u8,
            lba5: (lba >> 40) as u8,
            features_high: 0,
            count_low: sector_count as u8,
            count_high: (sector_count >> 8) as u8,
            icc: 0,
            control: 0,
            _reserved: [0; 4],
        }
    }
}

/// One command header (32 bytes); the command list is an array of these,
/// 1 KiB aligned.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct CommandHeader {
    /// CFL in bits 4:0, W in bit 6, P in bit 7.
    pub flags: u16,
    /// PRDT length in entries.
    pub prdt_length: u16,
    /// Bytes transferred, written back by the controller.
    pub prd_byte_count: u32,
    /// Command table base, low dword (128-byte aligned).
    pub table_base: u32,
    /// Command table base, high dword.
    pub table_base_high: u32,
    /// Reserved.
    pub _reserved: [u32; 4],
}

/// Command-header write bit.
pub const HEADER_FLAG_WRITE: u16 = 1 << 6;

/// Command FIS length in dwords (20 bytes / 4).
pub const FIS_LENGTH_DWORDS: u16 = 5;

/// One PRDT entry (16 bytes): a physically contiguous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PrdtEntry {
    /// Data base, low dword (2-byte aligned).
    pub data_base: u32,
    /// Data base, high dword.
    pub data_base_high: u32,
    /// Reserved.
    pub _reserved: u32,
    /// Byte count minus one in bits 21:0; bit 31 = interrupt on
    /// completion.
    pub byte_count_field: u32,
}

impl PrdtEntry {
    /// Builds an entry for `byte_count` bytes at `phys`. The count is
    /// stored as `count - 1` per the hardware convention and must be
    /// even and at most 4 MiB.
    #[must_use]
    pub fn new(phys: u64, byte_count: u32, interrupt: bool) -> Self {
        debug_assert!(byte_count > 0 && byte_count <= MAX_PRDT_BYTES as u32);
        debug_assert!(byte_count % 2 == 0, "PRDT byte counts must be even");
        let mut field = byte_count - 1;
        if interrupt {
            field |= 1 << 31;
        }
        Self {
            data_base: phys as u32,
            data_base_high: (phys >> 32) as u32,
            _reserved: 0,
            byte_count_field: field,
        }
    }

    /// The entry's byte count.
    #[must_use]
    pub fn byte_count(&self) -> u32 {
        (self.byte_count_field & 0x3F_FFFF) + 1
    }

    /// The entry's physical base address.
    #[must_use]
    pub fn physical_base(&self) -> u64 {
        let high = self.data_base_high;
        let low = self.data_base;
        (u64::from(high) << 32) | u64::from(low)
    }
}

/// Largest run one PRDT entry can describe.
pub const MAX_PRDT_BYTES: usize = 4 << 20;

/// PRDT entries per command table.
pub const PRDT_ENTRIES: usize = 56;

/// Received-FIS area (256 bytes, 256-byte aligned).
#[derive(Clone, Copy)]
#[repr(C, align(256))]
pub struct ReceivedFis {
    /// Raw FIS storage; the controller sorts incoming FISes into it.
    pub data: [u8; 256],
}

/// A command table: the command FIS, ATAPI area, and the PRDT.
/// 128-byte aligned.
#[repr(C, align(128))]
pub struct CommandTable {
    /// Command FIS area (64 bytes).
    pub fis: [u8; 64],
    /// ATAPI command area (16 bytes).
    pub atapi: [u8; 16],
    /// Reserved.
    pub _reserved: [u8; 48],
    /// The scatter-gather list.
    pub prdt: [PrdtEntry; PRDT_ENTRIES],
}

const _: () = {
    assert!(core::mem::size_of::<FisRegH2d>() == 20);
    assert!(core::mem::size_of::<CommandHeader>() == 32);
    assert!(core::mem::size_of::<PrdtEntry>() == 16);
    assert!(core::mem::size_of::<ReceivedFis>() == 256);
    assert!(core::mem::size_of::<CommandTable>() == 128 + PRDT_ENTRIES * 16);
};
