//! Multiple APIC Description Table (signature `APIC`) parsing.
//!
//! The MADT enumerates the interrupt topology: per-CPU local APICs,
//! I/O APICs with their GSI bases, and the ISA-IRQ-to-GSI source
//! overrides the dispatch core must honor when routing legacy IRQs.

use crate::sdt::{SdtHeader, checksum_ok};
use crate::{AcpiError, AcpiHandler, map_table};

/// MADT table signature.
pub const SIGNATURE: &[u8; 4] = b"APIC";

/// Fixed fields after the SDT header: LAPIC address and flags.
const FIXED_FIELDS: usize = 8;

/// Parsed MADT.
pub struct Madt<'a> {
    /// Physical address of the local APIC register block.
    pub local_apic_address: u32,
    /// MADT flags; bit 0 set means dual 8259 PICs are wired up.
    pub flags: u32,
    entries: &'a [u8],
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

impl<'a> Madt<'a> {
    /// Parses the MADT at `phys`.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] / [`AcpiError::InvalidChecksum`]
    /// on a bad table, [`AcpiError::Truncated`] if the fixed fields do
    /// not fit.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: caller provides a table address from the root table.
        let table = unsafe { map_table(handler, phys)? };
        let header = SdtHeader::read(table).ok_or(AcpiError::Truncated)?;

        if &header.signature != SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }
        if !checksum_ok(table) {
            return Err(AcpiError::InvalidChecksum);
        }
        if table.len() < SdtHeader::SIZE + FIXED_FIELDS {
            return Err(AcpiError::Truncated);
        }

        Ok(Self {
            local_apic_address: read_u32(table, SdtHeader::SIZE),
            flags: read_u32(table, SdtHeader::SIZE + 4),
            entries: &table[SdtHeader::SIZE + FIXED_FIELDS..],
        })
    }

    /// Iterates over the interrupt-controller entries.
    #[must_use]
    pub fn entries(&self) -> EntryIter<'a> {
        EntryIter {
            data: self.entries,
        }
    }
}

/// Processor local APIC (entry type 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApicEntry {
    /// ACPI processor UID.
    pub processor_id: u8,
    /// The processor's LAPIC ID.
    pub apic_id: u8,
    /// Bit 0: enabled. Bit 1: online capable.
    pub flags: u32,
}

impl LocalApicEntry {
    /// Returns `true` if the processor is usable.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// I/O APIC (entry type 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicEntry {
    /// The I/O APIC ID.
    pub id: u8,
    /// Physical address of the I/O APIC register pair.
    pub address: u32,
    /// First Global System Interrupt this I/O APIC serves.
    pub gsi_base: u32,
}

/// ISA interrupt source override (entry type 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOverrideEntry {
    /// Bus (always 0 = ISA).
    pub bus: u8,
    /// ISA IRQ number being overridden.
    pub source: u8,
    /// The GSI it is actually wired to.
    pub gsi: u32,
    /// MPS INTI flags (polarity / trigger mode).
    pub flags: u16,
}

/// One MADT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0.
    LocalApic(LocalApicEntry),
    /// Type 1.
    IoApic(IoApicEntry),
    /// Type 2.
    SourceOverride(SourceOverrideEntry),
    /// Any entry type this kernel does not route.
    Other {
        /// The raw entry type.
        entry_type: u8,
    },
}

/// Iterator over MADT entries. Each entry starts with a 2-byte
/// `(type, length)` header.
pub struct EntryIter<'a> {
    data: &'a [u8],
}

impl Iterator for EntryIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let entry_type = self.data[0];
        let length = self.data[1] as usize;
        if length < 2 || length > self.data.len() {
            return None;
        }
        let body = &self.data[..length];
        self.data = &self.data[length..];

        let entry = match entry_type {
            0 if length >= 8 => MadtEntry::LocalApic(LocalApicEntry {
                processor_id: body[2],
                apic_id: body[3],
                flags: read_u32(body, 4),
            }),
            1 if length >= 12 => MadtEntry::IoApic(IoApicEntry {
                id: body[2],
                // body[3] is reserved
                address: read_u32(body, 4),
                gsi_base: read_u32(body, 8),
            }),
            2 if length >= 10 => MadtEntry::SourceOverride(SourceOverrideEntry {
                bus: body[2],
                source: body[3],
                gsi: read_u32(body, 4),
                flags: read_u16(body, 8),
            }),
            _ => MadtEntry::Other { entry_type },
        };
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BufferHandler, build_table};

    fn build_madt(lapic_addr: u32, entries: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&lapic_addr.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes()); // PCAT_COMPAT
        for entry in entries {
            body.extend_from_slice(entry);
        }
        build_table(SIGNATURE, &body)
    }

    fn lapic(processor: u8, apic: u8, flags: u32) -> Vec<u8> {
        let mut e = vec![0u8, 8, processor, apic];
        e.extend_from_slice(&flags.to_le_bytes());
        e
    }

    fn ioapic(id: u8, address: u32, gsi_base: u32) -> Vec<u8> {
        let mut e = vec![1u8, 12, id, 0];
        e.extend_from_slice(&address.to_le_bytes());
        e.extend_from_slice(&gsi_base.to_le_bytes());
        e
    }

    fn override_entry(source: u8, gsi: u32, flags: u16) -> Vec<u8> {
        let mut e = vec![2u8, 10, 0, source];
        e.extend_from_slice(&gsi.to_le_bytes());
        e.extend_from_slice(&flags.to_le_bytes());
        e
    }

    #[test]
    fn parses_topology() {
        let data = build_madt(
            0xFEE0_0000,
            &[
                &lapic(0, 0, 1),
                &lapic(1, 1, 1),
                &ioapic(0, 0xFEC0_0000, 0),
                &override_entry(0, 2, 0),
            ],
        );
        let handler = BufferHandler(data);
        let madt = Madt::parse(&handler, 0).unwrap();
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);

        let entries: Vec<_> = madt.entries().collect();
        assert_eq!(entries.len(), 4);
        assert!(matches!(
            entries[0],
            MadtEntry::LocalApic(LocalApicEntry { apic_id: 0, .. })
        ));
        assert!(matches!(
            entries[2],
            MadtEntry::IoApic(IoApicEntry {
                address: 0xFEC0_0000,
                gsi_base: 0,
                ..
            })
        ));
        assert_eq!(
            entries[3],
            MadtEntry::SourceOverride(SourceOverrideEntry {
                bus: 0,
                source: 0,
                gsi: 2,
                flags: 0,
            })
        );
    }

    #[test]
    fn unknown_entries_skipped_not_fatal() {
        // Type 9 (x2APIC) entry, 16 bytes.
        let mut x2apic = vec![9u8, 16];
        x2apic.extend_from_slice(&[0u8; 14]);
        let data = build_madt(0xFEE0_0000, &[&x2apic, &lapic(0, 0, 1)]);
        let handler = BufferHandler(data);
        let madt = Madt::parse(&handler, 0).unwrap();

        let entries: Vec<_> = madt.entries().collect();
        assert_eq!(entries[0], MadtEntry::Other { entry_type: 9 });
        assert!(matches!(entries[1], MadtEntry::LocalApic(_)));
    }

    #[test]
    fn zero_length_entry_terminates() {
        let data = build_madt(0, &[&[0u8, 0, 0, 0]]);
        let handler = BufferHandler(data);
        let madt = Madt::parse(&handler, 0).unwrap();
        assert_eq!(madt.entries().count(), 0);
    }

    #[test]
    fn wrong_signature() {
        let data = build_table(b"HPET", &[0u8; 8]);
        let handler = BufferHandler(data);
        assert!(matches!(
            Madt::parse(&handler, 0),
            Err(AcpiError::InvalidSignature)
        ));
    }

    #[test]
    fn disabled_cpu_flag() {
        let entry = LocalApicEntry {
            processor_id: 2,
            apic_id: 2,
            flags: 0,
        };
        assert!(!entry.enabled());
    }
}
