//! Root System Description Pointer validation.
//!
//! Normally the RSDP arrives pre-copied in a Multiboot2 tag, but the
//! kernel can also validate one in firmware memory through a handler.
//! ACPI 1.0 defines 20 bytes ending in the 32-bit RSDT address; 2.0+
//! extends to 36 bytes with a 64-bit XSDT address and a second checksum.

use crate::sdt::checksum_ok;
use crate::{AcpiError, AcpiHandler};

/// The 8-byte RSDP signature, trailing space included.
pub const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// Size of the ACPI 1.0 structure.
pub const RSDP_V1_SIZE: usize = 20;

/// Size of the ACPI 2.0+ structure.
pub const RSDP_V2_SIZE: usize = 36;

/// Parses and validates the RSDP at `phys`.
///
/// Returns the root table address and whether it is an XSDT.
///
/// # Errors
///
/// [`AcpiError::InvalidRsdp`] on a bad signature,
/// [`AcpiError::InvalidChecksum`] on a checksum failure, and
/// [`AcpiError::InvalidRevision`] for unknown revisions.
pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<(u64, bool), AcpiError> {
    // Map the larger v2 size; v1 parsing just ignores the tail.
    // SAFETY: the caller provides a valid RSDP address.
    let ptr = unsafe { handler.map_physical_region(phys, RSDP_V2_SIZE) };
    // SAFETY: ptr covers RSDP_V2_SIZE bytes.
    let data = unsafe { core::slice::from_raw_parts(ptr, RSDP_V2_SIZE) };

    if &data[..8] != RSDP_SIGNATURE {
        return Err(AcpiError::InvalidRsdp);
    }
    if !checksum_ok(&data[..RSDP_V1_SIZE]) {
        return Err(AcpiError::InvalidChecksum);
    }

    match data[15] {
        0 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[16..20]);
            Ok((u64::from(u32::from_le_bytes(bytes)), false))
        }
        2 => {
            if !checksum_ok(&data[..RSDP_V2_SIZE]) {
                return Err(AcpiError::InvalidChecksum);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[24..32]);
            Ok((u64::from_le_bytes(bytes), true))
        }
        _ => Err(AcpiError::InvalidRevision),
    }
}
