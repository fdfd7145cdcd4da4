//! RSDT / XSDT enumeration.
//!
//! The root table is an SDT whose body is an array of physical table
//! addresses: 32-bit entries in the RSDT, 64-bit in the XSDT.

use crate::sdt::{SdtHeader, checksum_ok};
use crate::{AcpiError, AcpiHandler, map_table};

/// The parsed root table: a list of child table addresses.
pub struct RootTable<'a> {
    entries: &'a [u8],
    entry_size: usize,
}

impl<'a> RootTable<'a> {
    /// Parses the RSDT or XSDT at `phys`.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] unless the signature is `RSDT`
    /// (with `is_xsdt == false`) or `XSDT` (with `is_xsdt == true`), and
    /// [`AcpiError::InvalidChecksum`] when the table is corrupt.
    pub fn parse(
        handler: &impl AcpiHandler,
        phys: u64,
        is_xsdt: bool,
    ) -> Result<Self, AcpiError> {
        // SAFETY: caller provides the root table address from the RSDP.
        let table = unsafe { map_table(handler, phys)? };
        let header = SdtHeader::read(table).ok_or(AcpiError::Truncated)?;

        let expected: &[u8; 4] = if is_xsdt { b"XSDT" } else { b"RSDT" };
        if &header.signature != expected {
            return Err(AcpiError::InvalidSignature);
        }
        if !checksum_ok(table) {
            return Err(AcpiError::InvalidChecksum);
        }

        Ok(Self {
            entries: &table[SdtHeader::SIZE..],
            entry_size: if is_xsdt { 8 } else { 4 },
        })
    }

    /// Number of child tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() / self.entry_size
    }

    /// Returns `true` if the root table lists no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the child table physical addresses.
    pub fn entries(&self) -> impl Iterator<Item = u64> + use<'a> {
        let entry_size = self.entry_size;
        let entries = self.entries;
        (0..self.len()).map(move |i| {
            let offset = i * entry_size;
            if entry_size == 8 {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&entries[offset..offset + 8]);
                u64::from_le_bytes(bytes)
            } else {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&entries[offset..offset + 4]);
                u64::from(u32::from_le_bytes(bytes))
            }
        })
    }
}

/// Reads the signature of the table at `phys`.
///
/// # Safety
///
/// `phys` must point at a mapped SDT.
pub unsafe fn table_signature(handler: &impl AcpiHandler, phys: u64) -> [u8; 4] {
    // SAFETY: forwarded caller contract.
    let ptr = unsafe { handler.map_physical_region(phys, 4) };
    let mut signature = [0u8; 4];
    // SAFETY: ptr covers 4 bytes.
    signature.copy_from_slice(unsafe { core::slice::from_raw_parts(ptr, 4) });
    signature
}
