//! Fixed ACPI Description Table (signature `FACP`) parsing.
//!
//! Informational only: the kernel prints the preferred power-management
//! profile and moves on.

use crate::sdt::{SdtHeader, checksum_ok};
use crate::{AcpiError, AcpiHandler, map_table};

/// FADT table signature.
pub const SIGNATURE: &[u8; 4] = b"FACP";

/// Byte offset of the preferred PM profile within the table.
const PM_PROFILE_OFFSET: usize = 45;

/// The firmware's preferred power-management profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmProfile {
    /// 0 — unspecified.
    Unspecified,
    /// 1 — desktop.
    Desktop,
    /// 2 — mobile.
    Mobile,
    /// 3 — workstation.
    Workstation,
    /// 4 — enterprise server.
    EnterpriseServer,
    /// 5 — SOHO server.
    SohoServer,
    /// 6 — appliance PC.
    AppliancePc,
    /// 7 — performance server.
    PerformanceServer,
    /// 8 — tablet.
    Tablet,
    /// Anything newer than this kernel.
    Unknown(u8),
}

impl PmProfile {
    /// Decodes the raw profile byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Unspecified,
            1 => Self::Desktop,
            2 => Self::Mobile,
            3 => Self::Workstation,
            4 => Self::EnterpriseServer,
            5 => Self::SohoServer,
            6 => Self::AppliancePc,
            7 => Self::PerformanceServer,
            8 => Self::Tablet,
            other => Self::Unknown(other),
        }
    }

    /// Human-readable name for the boot log.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Workstation => "workstation",
            Self::EnterpriseServer => "enterprise server",
            Self::SohoServer => "SOHO server",
            Self::AppliancePc => "appliance PC",
            Self::PerformanceServer => "performance server",
            Self::Tablet => "tablet",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Parses the FADT at `phys` and returns the preferred PM profile.
///
/// # Errors
///
/// [`AcpiError::InvalidSignature`] / [`AcpiError::InvalidChecksum`] on a
/// bad table.
pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<PmProfile, AcpiError> {
    // SAFETY: caller provides a table address from the root table.
    let table = unsafe { map_table(handler, phys)? };
    let header = SdtHeader::read(table).ok_or(AcpiError::Truncated)?;

    if &header.signature != SIGNATURE {
        return Err(AcpiError::InvalidSignature);
    }
    if !checksum_ok(table) {
        return Err(AcpiError::InvalidChecksum);
    }
    if table.len() <= PM_PROFILE_OFFSET {
        return Err(AcpiError::Truncated);
    }

    Ok(PmProfile::from_raw(table[PM_PROFILE_OFFSET]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BufferHandler, build_table};

    #[test]
    fn reads_profile_byte() {
        let mut body = vec![0u8; 80];
        body[PM_PROFILE_OFFSET - SdtHeader::SIZE] = 1;
        let handler = BufferHandler(build_table(SIGNATURE, &body));
        assert_eq!(parse(&handler, 0), Ok(PmProfile::Desktop));
    }

    #[test]
    fn unknown_profile_preserved() {
        let mut body = vec![0u8; 80];
        body[PM_PROFILE_OFFSET - SdtHeader::SIZE] = 42;
        let handler = BufferHandler(build_table(SIGNATURE, &body));
        assert_eq!(parse(&handler, 0), Ok(PmProfile::Unknown(42)));
        assert_eq!(PmProfile::Unknown(42).name(), "unknown");
    }
}
