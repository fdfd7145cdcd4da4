//! ACPI table parsers.
//!
//! Freestanding and allocation-free: every parser receives an
//! [`AcpiHandler`] that maps a physical region and returns a pointer, so
//! the same code runs against the kernel's linear window and against
//! plain buffers in hosted tests.
//!
//! Supported tables: RSDP (v1/v2), RSDT/XSDT, MADT (`APIC`), MCFG, HPET,
//! and FADT (`FACP`). Everything else is surfaced to the caller as an
//! unhandled signature.

#![cfg_attr(not(test), no_std)]

pub mod fadt;
pub mod hpet;
pub mod madt;
pub mod mcfg;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

/// Failure modes shared by all parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The table signature did not match the expected one.
    InvalidSignature,
    /// The table bytes do not sum to zero.
    InvalidChecksum,
    /// The RSDP failed signature or checksum validation.
    InvalidRsdp,
    /// The RSDP revision is not 0 or 2.
    InvalidRevision,
    /// A declared length is too small to contain the mandatory fields.
    Truncated,
}

/// Maps physical memory for the parsers.
///
/// The kernel implements this over its linear physical window; tests
/// implement it over owned buffers.
pub trait AcpiHandler {
    /// Maps `size` bytes of physical memory at `phys` and returns a
    /// pointer to the mapping.
    ///
    /// # Safety
    ///
    /// `phys..phys + size` must be readable physical memory for the
    /// lifetime of the returned pointer.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8;
}

/// Maps an entire table: reads the header at `phys` to learn the length,
/// then returns the full table as a byte slice.
///
/// # Safety
///
/// `phys` must point at a valid SDT whose memory stays mapped for `'a`.
pub(crate) unsafe fn map_table<'a>(
    handler: &impl AcpiHandler,
    phys: u64,
) -> Result<&'a [u8], AcpiError> {
    // SAFETY: caller provides a valid table address.
    let header_ptr = unsafe { handler.map_physical_region(phys, sdt::SdtHeader::SIZE) };
    // SAFETY: header_ptr covers SdtHeader::SIZE bytes.
    let header_bytes = unsafe { core::slice::from_raw_parts(header_ptr, sdt::SdtHeader::SIZE) };
    let header = sdt::SdtHeader::read(header_bytes).ok_or(AcpiError::Truncated)?;

    let total_len = header.length as usize;
    if total_len < sdt::SdtHeader::SIZE {
        return Err(AcpiError::Truncated);
    }

    // SAFETY: total_len comes from the table's own header.
    let table_ptr = unsafe { handler.map_physical_region(phys, total_len) };
    // SAFETY: table_ptr covers total_len bytes.
    Ok(unsafe { core::slice::from_raw_parts(table_ptr, total_len) })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AcpiHandler;
    use super::sdt::SdtHeader;

    /// Handler over a single owned buffer: physical address n maps to
    /// byte n of the buffer.
    pub struct BufferHandler(pub Vec<u8>);

    impl AcpiHandler for BufferHandler {
        unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8 {
            assert!(phys as usize + size <= self.0.len(), "mapping out of range");
            self.0[phys as usize..].as_ptr()
        }
    }

    /// Builds a table: SDT header with `signature`, then `body`, with the
    /// checksum fixed up.
    pub fn build_table(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; SdtHeader::SIZE];
        data[..4].copy_from_slice(signature);
        let total = (SdtHeader::SIZE + body.len()) as u32;
        data[4..8].copy_from_slice(&total.to_le_bytes());
        data[8] = 1; // revision
        data.extend_from_slice(body);

        let sum: u8 = data.iter().fold(0u8, |s, &b| s.wrapping_add(b));
        data[9] = 0u8.wrapping_sub(sum);
        data
    }
}
