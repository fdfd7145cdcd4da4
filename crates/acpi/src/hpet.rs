//! HPET description table parsing.
//!
//! The table locates the timer block and carries a copy of its
//! capabilities. The kernel only trusts the address; counts and the tick
//! period are re-read from the live capability register.

use crate::sdt::{SdtHeader, checksum_ok};
use crate::{AcpiError, AcpiHandler, map_table};

/// HPET table signature.
pub const SIGNATURE: &[u8; 4] = b"HPET";

/// Generic Address Structure `address_space_id` for system memory.
pub const ADDRESS_SPACE_MEMORY: u8 = 0;

/// Parsed HPET description.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Event timer block ID (copy of the capability register's low
    /// dword).
    pub block_id: u32,
    /// Address space of the register block; anything but
    /// [`ADDRESS_SPACE_MEMORY`] is unsupported.
    pub address_space_id: u8,
    /// Physical base of the register block.
    pub base_address: u64,
    /// HPET sequence number.
    pub number: u8,
    /// Minimum clock tick in periodic mode.
    pub minimum_tick: u16,
}

impl HpetTable {
    /// Returns `true` when the register block is memory-mapped.
    #[must_use]
    pub const fn is_memory_mapped(&self) -> bool {
        self.address_space_id == ADDRESS_SPACE_MEMORY
    }

    /// Comparators in the block, from the block ID (bits 8..12 encode
    /// the count minus one).
    #[must_use]
    pub const fn comparator_count(&self) -> u8 {
        (((self.block_id >> 8) & 0x1F) + 1) as u8
    }
}

/// Parses the HPET table at `phys`.
///
/// # Errors
///
/// [`AcpiError::InvalidSignature`] / [`AcpiError::InvalidChecksum`] on a
/// bad table, [`AcpiError::Truncated`] if the fixed fields do not fit.
pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<HpetTable, AcpiError> {
    // SAFETY: caller provides a table address from the root table.
    let table = unsafe { map_table(handler, phys)? };
    let header = SdtHeader::read(table).ok_or(AcpiError::Truncated)?;

    if &header.signature != SIGNATURE {
        return Err(AcpiError::InvalidSignature);
    }
    if !checksum_ok(table) {
        return Err(AcpiError::InvalidChecksum);
    }
    // Header + block id (4) + GAS (12) + number (1) + min tick (2).
    if table.len() < SdtHeader::SIZE + 19 {
        return Err(AcpiError::Truncated);
    }

    let body = &table[SdtHeader::SIZE..];
    let mut block_id = [0u8; 4];
    block_id.copy_from_slice(&body[0..4]);
    let mut base = [0u8; 8];
    base.copy_from_slice(&body[8..16]);
    let mut minimum_tick = [0u8; 2];
    minimum_tick.copy_from_slice(&body[17..19]);

    Ok(HpetTable {
        block_id: u32::from_le_bytes(block_id),
        address_space_id: body[4],
        base_address: u64::from_le_bytes(base),
        number: body[16],
        minimum_tick: u16::from_le_bytes(minimum_tick),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BufferHandler, build_table};

    fn build_hpet(block_id: u32, space: u8, base: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&block_id.to_le_bytes());
        body.push(space); // address_space_id
        body.push(64); // register_bit_width
        body.push(0); // register_bit_offset
        body.push(0); // reserved
        body.extend_from_slice(&base.to_le_bytes());
        body.push(0); // hpet number
        body.extend_from_slice(&0x80u16.to_le_bytes()); // minimum tick
        body.push(0); // page protection
        build_table(SIGNATURE, &body)
    }

    #[test]
    fn parses_fields() {
        // Block ID with 3 comparators (count - 1 = 2 in bits 8..12).
        let handler = BufferHandler(build_hpet(2 << 8, 0, 0xFED0_0000));
        let hpet = parse(&handler, 0).unwrap();
        assert_eq!(hpet.base_address, 0xFED0_0000);
        assert!(hpet.is_memory_mapped());
        assert_eq!(hpet.comparator_count(), 3);
        assert_eq!(hpet.minimum_tick, 0x80);
    }

    #[test]
    fn io_space_flagged() {
        let handler = BufferHandler(build_hpet(0, 1, 0x400));
        let hpet = parse(&handler, 0).unwrap();
        assert!(!hpet.is_memory_mapped());
    }
}
