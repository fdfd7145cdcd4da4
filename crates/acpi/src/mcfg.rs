//! PCI Express ECAM description (MCFG) parsing.
//!
//! Each MCFG entry names one ECAM window: a physical base plus the
//! segment and bus range whose configuration space it exposes, one
//! 4 KiB page per function.

use crate::sdt::{SdtHeader, checksum_ok};
use crate::{AcpiError, AcpiHandler, map_table};

/// MCFG table signature.
pub const SIGNATURE: &[u8; 4] = b"MCFG";

/// Reserved bytes between the SDT header and the entry array.
const RESERVED: usize = 8;

/// Size of one entry.
const ENTRY_SIZE: usize = 16;

/// One ECAM window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcamWindow {
    /// Physical base of the window.
    pub base: u64,
    /// PCI segment group.
    pub segment: u16,
    /// First bus number decoded.
    pub start_bus: u8,
    /// Last bus number decoded.
    pub end_bus: u8,
}

impl EcamWindow {
    /// Physical address of the 4 KiB configuration page of
    /// `bus:device.function`.
    #[must_use]
    pub const fn function_base(&self, bus: u8, device: u8, function: u8) -> u64 {
        self.base
            + (((bus - self.start_bus) as u64) << 20)
            + ((device as u64) << 15)
            + ((function as u64) << 12)
    }
}

/// Parsed MCFG.
pub struct Mcfg<'a> {
    entries: &'a [u8],
}

impl<'a> Mcfg<'a> {
    /// Parses the MCFG at `phys`.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] / [`AcpiError::InvalidChecksum`]
    /// on a bad table.
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
        if table.len() < SdtHeader::SIZE + RESERVED {
            return Err(AcpiError::Truncated);
        }

        Ok(Self {
            entries: &table[SdtHeader::SIZE + RESERVED..],
        })
    }

    /// Number of ECAM windows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() / ENTRY_SIZE
    }

    /// Returns `true` if the table describes no windows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the windows.
    pub fn windows(&self) -> impl Iterator<Item = EcamWindow> + use<'a> {
        let entries = self.entries;
        (0..self.len()).map(move |i| {
            let offset = i * ENTRY_SIZE;
            let mut base = [0u8; 8];
            base.copy_from_slice(&entries[offset..offset + 8]);
            let mut segment = [0u8; 2];
            segment.copy_from_slice(&entries[offset + 8..offset + 10]);
            EcamWindow {
                base: u64::from_le_bytes(base),
                segment: u16::from_le_bytes(segment),
                start_bus: entries[offset + 10],
                end_bus: entries[offset + 11],
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BufferHandler, build_table};

    fn build_mcfg(windows: &[(u64, u16, u8, u8)]) -> Vec<u8> {
        let mut body = vec![0u8; RESERVED];
        for &(base, segment, start, end) in windows {
            body.extend_from_slice(&base.to_le_bytes());
            body.extend_from_slice(&segment.to_le_bytes());
            body.push(start);
            body.push(end);
            body.extend_from_slice(&0u32.to_le_bytes());
        }
        build_table(SIGNATURE, &body)
    }

    #[test]
    fn parses_windows() {
        let handler = BufferHandler(build_mcfg(&[(0xB000_0000, 0, 0, 255)]));
        let mcfg = Mcfg::parse(&handler, 0).unwrap();
        assert_eq!(mcfg.len(), 1);
        let window = mcfg.windows().next().unwrap();
        assert_eq!(window.base, 0xB000_0000);
        assert_eq!(window.end_bus, 255);
    }

    #[test]
    fn function_base_arithmetic() {
        let window = EcamWindow {
            base: 0xB000_0000,
            segment: 0,
            start_bus: 0,
            end_bus: 255,
        };
        assert_eq!(window.function_base(0, 0, 0), 0xB000_0000);
        assert_eq!(window.function_base(1, 0, 0), 0xB010_0000);
        assert_eq!(window.function_base(0, 1, 0), 0xB000_8000);
        assert_eq!(window.function_base(0, 0, 1), 0xB000_1000);
        assert_eq!(window.function_base(2, 3, 1), 0xB021_9000);
    }

    #[test]
    fn start_bus_offset() {
        let window = EcamWindow {
            base: 0xC000_0000,
            segment: 1,
            start_bus: 0x20,
            end_bus: 0x3F,
        };
        assert_eq!(window.function_base(0x20, 0, 0), 0xC000_0000);
        assert_eq!(window.function_base(0x21, 0, 0), 0xC010_0000);
    }

    #[test]
    fn empty_table() {
        let handler = BufferHandler(build_mcfg(&[]));
        let mcfg = Mcfg::parse(&handler, 0).unwrap();
        assert!(mcfg.is_empty());
    }
}
