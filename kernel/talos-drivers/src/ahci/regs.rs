//! AHCI register offsets, flags, and ATA constants.
//!
//! Follows the Intel AHCI 1.3.1 register file: generic host control at
//! the start of ABAR, one 0x80-byte port block per port starting at
//! 0x100.

use bitflags::bitflags;

// ---------------------------------------------------------------------------
// Generic host control offsets
// ---------------------------------------------------------------------------

/// Host capabilities.
pub const HBA_CAP: u64 = 0x00;
/// Global host control.
pub const HBA_GHC: u64 = 0x04;
/// Interrupt status.
pub const HBA_IS: u64 = 0x08;
/// Ports implemented bitmap.
pub const HBA_PI: u64 = 0x0C;
/// AHCI version.
pub const HBA_VS: u64 = 0x10;
/// Extended capabilities.
pub const HBA_CAP2: u64 = 0x24;
/// BIOS/OS handoff control.
pub const HBA_BOHC: u64 = 0x28;

// ---------------------------------------------------------------------------
// Per-port offsets (base = 0x100 + port * 0x80)
// ---------------------------------------------------------------------------

/// First port block.
pub const PORT_BASE: u64 = 0x100;
/// Port block stride.
pub const PORT_STRIDE: u64 = 0x80;

/// Command list base, low dword.
pub const PORT_CLB: u64 = 0x00;
/// Command list base, high dword.
pub const PORT_CLBU: u64 = 0x04;
/// Received-FIS base, low dword.
pub const PORT_FB: u64 = 0x08;
/// Received-FIS base, high dword.
pub const PORT_FBU: u64 = 0x0C;
/// Interrupt status.
pub const PORT_IS: u64 = 0x10;
/// Interrupt enable.
pub const PORT_IE: u64 = 0x14;
/// Command and status.
pub const PORT_CMD: u64 = 0x18;
/// Task file data.
pub const PORT_TFD: u64 = 0x20;
/// Device signature.
pub const PORT_SIG: u64 = 0x24;
/// SATA status (SStatus).
pub const PORT_SSTS: u64 = 0x28;
/// SATA control (SControl).
pub const PORT_SCTL: u64 = 0x2C;
/// SATA error (SError).
pub const PORT_SERR: u64 = 0x30;
/// SATA active.
pub const PORT_SACT: u64 = 0x34;
/// Command issue.
pub const PORT_CI: u64 = 0x38;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Host capabilities (CAP).
    #[derive(Debug, Clone, Copy)]
    pub struct HbaCap: u32 {
        /// 64-bit addressing supported.
        const S64A = 1 << 31;
        const _ = !0;
    }
}

impl HbaCap {
    /// Command slots per port (1-32).
    #[must_use]
    pub const fn command_slots(self) -> u8 {
        (((self.bits() >> 8) & 0x1F) + 1) as u8
    }
}

bitflags! {
    /// Global host control (GHC).
    #[derive(Debug, Clone, Copy)]
    pub struct HbaGhc: u32 {
        /// AHCI enable.
        const AE = 1 << 31;
        /// Interrupt enable.
        const IE = 1 << 1;
        /// Controller reset; self-clears.
        const HR = 1 << 0;
    }
}

bitflags! {
    /// Extended capabilities (CAP2).
    #[derive(Debug, Clone, Copy)]
    pub struct HbaCap2: u32 {
        /// BIOS/OS handoff supported.
        const BOH = 1 << 0;
        const _ = !0;
    }
}

bitflags! {
    /// BIOS/OS handoff control (BOHC).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HbaBohc: u32 {
        /// BIOS owned semaphore.
        const BOS = 1 << 0;
        /// OS owned semaphore.
        const OOS = 1 << 1;
        /// SMI on ownership change.
        const SOOE = 1 << 2;
        /// OS ownership change.
        const OOC = 1 << 3;
        /// BIOS busy.
        const BB = 1 << 4;
    }
}

bitflags! {
    /// Port command and status (PxCMD).
    #[derive(Debug, Clone, Copy)]
    pub struct PortCmd: u32 {
        /// Start command processing.
        const ST = 1 << 0;
        /// FIS receive enable.
        const FRE = 1 << 4;
        /// FIS receive running.
        const FR = 1 << 14;
        /// Command list running.
        const CR = 1 << 15;
    }
}

bitflags! {
    /// Port interrupt status (PxIS).
    #[derive(Debug, Clone, Copy)]
    pub struct PortIs: u32 {
        /// Device-to-host register FIS received.
        const DHRS = 1 << 0;
        /// PIO setup FIS received.
        const PSS = 1 << 1;
        /// Task file error.
        const TFES = 1 << 30;
    }
}

// ---------------------------------------------------------------------------
// Task file data
// ---------------------------------------------------------------------------

/// TFD busy bit (status register bit 7).
pub const TFD_BSY: u32 = 1 << 7;
/// TFD data-request bit (status register bit 3).
pub const TFD_DRQ: u32 = 1 << 3;
/// TFD error bit (status register bit 0).
pub const TFD_ERR: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// SStatus / SControl
// ---------------------------------------------------------------------------

/// SControl DET field value starting COMRESET.
pub const SCTL_DET_INIT: u32 = 1;

/// Extracts the DET field (bits 3:0) of SStatus.
#[must_use]
pub const fn ssts_det(ssts: u32) -> u8 {
    (ssts & 0x0F) as u8
}

/// Extracts the IPM field (bits 11:8) of SStatus.
#[must_use]
pub const fn ssts_ipm(ssts: u32) -> u8 {
    ((ssts >> 8) & 0x0F) as u8
}

/// DET: device present, Phy communication up.
pub const SSTS_DET_PRESENT: u8 = 3;
/// IPM: interface active.
pub const SSTS_IPM_ACTIVE: u8 = 1;

// ---------------------------------------------------------------------------
// Device signatures
// ---------------------------------------------------------------------------

/// Plain SATA drive.
pub const SIG_SATA: u32 = 0x0000_0101;
/// SATAPI (packet) device.
pub const SIG_SATAPI: u32 = 0xEB14_0101;
/// Enclosure management bridge.
pub const SIG_SEMB: u32 = 0xC33C_0101;
/// Port multiplier.
pub const SIG_PORT_MULTIPLIER: u32 = 0x9669_0101;

// ---------------------------------------------------------------------------
// ATA
// ---------------------------------------------------------------------------

/// IDENTIFY DEVICE.
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
/// READ DMA EXT (48-bit LBA).
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
/// WRITE DMA EXT (48-bit LBA).
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;

/// Register host-to-device FIS type byte.
pub const FIS_TYPE_REG_H2D: u8 = 0x27;
