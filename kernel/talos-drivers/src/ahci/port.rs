//! Per-port bring-up and command submission.
//!
//! Each implemented port gets a COMRESET, a presence check, freshly
//! allocated DMA structures (command list + received FIS in one frame,
//! command tables in a second region), and an IDENTIFY. Commands go
//! through the slot bitmap: the lowest slot clear in `SACT | CI` is
//! claimed, filled, and issued, and completion is polled with error
//! checks on SERR and the task file.

use talos_core::addr::VirtAddr;
use talos_core::{PAGE_SIZE, kinfo, kwarn};
use talos_kernel::memory;
use talos_kernel::time;
use talos_mm::temp;

use super::command::{
    CommandHeader, CommandTable, FIS_LENGTH_DWORDS, FisRegH2d, HEADER_FLAG_WRITE, PRDT_ENTRIES,
    PrdtEntry,
};
use super::prdt::{self, PrdtRun};
use super::regs::{self, PortCmd, ssts_det, ssts_ipm};

/// Bound for the port register spins.
const SPIN_TIMEOUT: u32 = 1_000_000;

/// Command-list slots worth of headers in the DMA frame. The hardware
/// may implement fewer; allocating the full 32 keeps the received-FIS
/// area at its architected 1 KiB offset.
const FULL_SLOT_COUNT: u64 = 32;

/// Byte offset of the received-FIS area inside the control frame.
const RECEIVED_FIS_OFFSET: u64 = FULL_SLOT_COUNT * 32;

/// What answered on the port, from the signature register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Plain SATA drive.
    Sata,
    /// Packet (ATAPI) device.
    Satapi,
    /// Enclosure management bridge.
    Semb,
    /// Port multiplier.
    PortMultiplier,
    /// Unrecognized signature.
    Unknown,
}

impl DeviceKind {
    /// Classifies a port signature register value.
    #[must_use]
    pub const fn from_signature(signature: u32) -> Self {
        match signature {
            regs::SIG_SATA => Self::Sata,
            regs::SIG_SATAPI => Self::Satapi,
            regs::SIG_SEMB => Self::Semb,
            regs::SIG_PORT_MULTIPLIER => Self::PortMultiplier,
            _ => Self::Unknown,
        }
    }

    /// Short name for logs and the storage registry.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sata => "sata",
            Self::Satapi => "satapi",
            Self::Semb => "semb",
            Self::PortMultiplier => "port-multiplier",
            Self::Unknown => "unknown",
        }
    }
}

/// What IDENTIFY reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyData {
    /// Addressable sectors.
    pub sector_count: u64,
    /// Logical sector size in bytes.
    pub sector_size: u64,
    /// Whether the 48-bit count was valid.
    pub lba48: bool,
}

/// Parses the 512-byte IDENTIFY block: the 48-bit sector count at word
/// 100 when non-zero, the 28-bit count at word 60 otherwise, and the
/// logical sector size from word 106 (512 unless the descriptor says
/// larger).
#[must_use]
pub fn parse_identify(data: &[u8; 512]) -> IdentifyData {
    let word = |index: usize| -> u64 {
        u64::from(u16::from_le_bytes([data[index * 2], data[index * 2 + 1]]))
    };

    // Words 100..104: 48-bit LBA count (byte offset 200).
    let lba48_count = word(100) | (word(101) << 16) | (word(102) << 32) | (word(103) << 48);
    // Words 60..62: 28-bit LBA count (byte offset 120).
    let lba28_count = word(60) | (word(61) << 16);

    let (sector_count, lba48) = if lba48_count != 0 {
        (lba48_count, true)
    } else {
        (lba28_count, false)
    };

    // Word 106: physical/logical sector size descriptor. Bit 14 set +
    // bit 15 clear marks it valid; bit 12 means the logical sector is
    // bigger than 256 words, with words 117..119 giving the size in
    // words.
    let w106 = word(106);
    let sector_size = if w106 & (1 << 14) != 0 && w106 & (1 << 15) == 0 && w106 & (1 << 12) != 0 {
        let words = word(117) | (word(118) << 16);
        words * 2
    } else {
        512
    };

    IdentifyData {
        sector_count,
        sector_size,
        lba48,
    }
}

/// Submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// Every implemented slot is in flight.
    OutOfSlots,
    /// The device never became ready, or the command never completed.
    Timeout,
    /// The device reported an error (SERR or task-file ERR).
    IoError,
    /// DMA memory could not be allocated.
    OutOfMemory,
}

/// One brought-up AHCI port with a device behind it.
pub struct AhciPort {
    regs: VirtAddr,
    slot_count: u8,
    control_phys: u64,
    tables_phys: u64,
    /// IDENTIFY results.
    pub identity: IdentifyData,
    /// Device classification from the signature register.
    pub kind: DeviceKind,
}

impl AhciPort {
    /// Brings up port `index` of the HBA at `abar`: COMRESET, presence
    /// check, DMA setup, engine start, IDENTIFY, classify.
    ///
    /// Returns `None` when no active device answers or bring-up fails;
    /// the port is then abandoned.
    ///
    /// # Safety
    ///
    /// `abar` must be the mapped ABAR of an AHCI controller in AHCI
    /// mode, and `index` an implemented port.
    pub unsafe fn init(abar: VirtAddr, index: u8, slot_count: u8) -> Option<Self> {
        let port_regs =
            VirtAddr::new(abar.as_u64() + regs::PORT_BASE + u64::from(index) * regs::PORT_STRIDE);

        let mut port = Self {
            regs: port_regs,
            slot_count,
            control_phys: 0,
            tables_phys: 0,
            identity: IdentifyData {
                sector_count: 0,
                sector_size: 512,
                lba48: false,
            },
            kind: DeviceKind::Unknown,
        };

        // COMRESET: drive DET through 1 -> 0.
        port.write(regs::PORT_SCTL, regs::SCTL_DET_INIT);
        time::sleep_ms(1);
        port.write(regs::PORT_SCTL, 0);

        // Wait for an active device.
        let mut present = false;
        for _ in 0..SPIN_TIMEOUT {
            let ssts = port.read(regs::PORT_SSTS);
            if ssts_det(ssts) == regs::SSTS_DET_PRESENT && ssts_ipm(ssts) == regs::SSTS_IPM_ACTIVE
            {
                present = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !present {
            return None;
        }

        port.write(regs::PORT_SERR, 0xFFFF_FFFF);
        port.stop_engine();

        if port.setup_dma().is_err() {
            kwarn!("AHCI: port {}: no memory for DMA structures", index);
            return None;
        }

        port.start_engine();

        match port.identify() {
            Ok(identity) => port.identity = identity,
            Err(error) => {
                kwarn!("AHCI: port {}: IDENTIFY failed: {:?}", index, error);
                return None;
            }
        }

        port.kind = DeviceKind::from_signature(port.read(regs::PORT_SIG));
        kinfo!(
            "AHCI: port {}: {} with {} sectors of {} bytes{}",
            index,
            port.kind.name(),
            port.identity.sector_count,
            port.identity.sector_size,
            if port.identity.lba48 { " (lba48)" } else { "" }
        );
        Some(port)
    }

    /// Allocates and wires the command list, received FIS, and command
    /// tables.
    fn setup_dma(&mut self) -> Result<(), PortError> {
        // One frame: 32 command headers (1 KiB) + received FIS.
        let control_phys = memory::allocate_frames(1).ok_or(PortError::OutOfMemory)?;
        // The command tables, contiguous.
        let tables_bytes = u64::from(self.slot_count) * core::mem::size_of::<CommandTable>() as u64;
        let tables_frames = tables_bytes.div_ceil(PAGE_SIZE);
        let tables_phys =
            memory::allocate_frames(tables_frames).ok_or(PortError::OutOfMemory)?;

        let control_virt = temp::kernel_alias(control_phys);
        let tables_virt = temp::kernel_alias(tables_phys);
        // SAFETY: freshly allocated, linearly mapped frames.
        unsafe {
            core::ptr::write_bytes(control_virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
            core::ptr::write_bytes(
                tables_virt.as_mut_ptr::<u8>(),
                0,
                (tables_frames * PAGE_SIZE) as usize,
            );
        }

        // Point each header at its table.
        for slot in 0..u64::from(self.slot_count) {
            let table_phys = tables_phys + slot * core::mem::size_of::<CommandTable>() as u64;
            let header = self.header_ptr(slot as u8);
            // SAFETY: header lies in the zeroed control frame.
            unsafe {
                (*header).table_base = table_phys as u32;
                (*header).table_base_high = (table_phys >> 32) as u32;
            }
        }

        self.control_phys = control_phys;
        self.tables_phys = tables_phys;

        self.write(regs::PORT_CLB, control_phys as u32);
        self.write(regs::PORT_CLBU, (control_phys >> 32) as u32);
        let fis_phys = control_phys + RECEIVED_FIS_OFFSET;
        self.write(regs::PORT_FB, fis_phys as u32);
        self.write(regs::PORT_FBU, (fis_phys >> 32) as u32);
        Ok(())
    }

    /// Runs IDENTIFY and parses the result.
    fn identify(&mut self) -> Result<IdentifyData, PortError> {
        let buffer_phys = memory::allocate_frames(1).ok_or(PortError::OutOfMemory)?;
        let buffer_virt = temp::kernel_alias(buffer_phys);
        // SAFETY: freshly allocated frame.
        unsafe { core::ptr::write_bytes(buffer_virt.as_mut_ptr::<u8>(), 0, 512) };

        let runs = [PrdtRun {
            phys: buffer_phys,
            bytes: 512,
        }];
        let result = self.issue(regs::ATA_CMD_IDENTIFY, 0, 1, false, &runs);

        let identity = result.map(|()| {
            // SAFETY: the device DMA-filled the 512-byte block.
            let block = unsafe { &*buffer_virt.as_ptr::<[u8; 512]>() };
            parse_identify(block)
        });

        memory::free_frames(buffer_phys, 1);
        identity
    }

    /// Returns the lowest free command slot.
    fn find_slot(&self) -> Result<u8, PortError> {
        let busy = self.read(regs::PORT_SACT) | self.read(regs::PORT_CI);
        for slot in 0..self.slot_count {
            if busy & (1 << slot) == 0 {
                return Ok(slot);
            }
        }
        Err(PortError::OutOfSlots)
    }

    /// Builds and issues one command, then polls it to completion.
    ///
    /// `runs` is the transfer's scatter-gather list; the sector count in
    /// the FIS is the run total divided by the logical sector size.
    pub fn issue(
        &mut self,
        command: u8,
        lba: u64,
        sector_count: u16,
        write: bool,
        runs: &[PrdtRun],
    ) -> Result<(), PortError> {
        assert!(runs.len() <= PRDT_ENTRIES);
        let slot = self.find_slot()?;

        // Fill the command table: FIS first, then the PRDT.
        let table = self.table_ptr(slot);
        let fis = FisRegH2d::command(command, lba, sector_count);
        // SAFETY: the table is this port's DMA memory and the slot is
        // free.
        unsafe {
            core::ptr::write_volatile((*table).fis.as_mut_ptr().cast::<FisRegH2d>(), fis);
            for (index, run) in runs.iter().enumerate() {
                let interrupt = index == runs.len() - 1;
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*table).prdt[index]),
                    PrdtEntry::new(run.phys, run.bytes, interrupt),
                );
            }
        }

        // Fill the header.
        let header = self.header_ptr(slot);
        let mut flags = FIS_LENGTH_DWORDS;
        if write {
            flags |= HEADER_FLAG_WRITE;
        }
        // SAFETY: the header is this port's DMA memory.
        unsafe {
            (*header).flags = flags;
            (*header).prdt_length = runs.len() as u16;
            (*header).prd_byte_count = 0;
        }

        self.wait_ready()?;

        self.write(regs::PORT_IS, 0xFFFF_FFFF);
        self.write(regs::PORT_CI, 1 << slot);

        self.wait_complete(slot)
    }

    /// Waits until the device clears BSY and DRQ.
    fn wait_ready(&self) -> Result<(), PortError> {
        for _ in 0..SPIN_TIMEOUT {
            let tfd = self.read(regs::PORT_TFD);
            if tfd & (regs::TFD_BSY | regs::TFD_DRQ) == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(PortError::Timeout)
    }

    /// Waits for `slot` to leave the command-issue register, watching
    /// for SERR and task-file errors. On error the port is recovered:
    /// SERR is cleared and the command engine restarted.
    fn wait_complete(&mut self, slot: u8) -> Result<(), PortError> {
        for _ in 0..SPIN_TIMEOUT {
            let serr = self.read(regs::PORT_SERR);
            let tfd = self.read(regs::PORT_TFD);
            if serr != 0 || tfd & regs::TFD_ERR != 0 {
                kwarn!("AHCI: command error (serr {:#x}, tfd {:#x})", serr, tfd);
                self.recover();
                return Err(PortError::IoError);
            }
            if self.read(regs::PORT_CI) & (1 << slot) == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        self.recover();
        Err(PortError::Timeout)
    }

    /// Post-error recovery: clear SERR, restart the command engine.
    fn recover(&mut self) {
        self.stop_engine();
        self.write(regs::PORT_SERR, 0xFFFF_FFFF);
        self.start_engine();
    }

    /// Stops command processing and FIS receive, waiting for the
    /// controller to actually let go.
    fn stop_engine(&mut self) {
        let cmd = self.read(regs::PORT_CMD);
        self.write(regs::PORT_CMD, cmd & !(PortCmd::ST.bits() | PortCmd::FRE.bits()));
        for _ in 0..SPIN_TIMEOUT {
            let cmd = self.read(regs::PORT_CMD);
            if cmd & (PortCmd::CR.bits() | PortCmd::FR.bits()) == 0 {
                return;
            }
            core::hint::spin_loop();
        }
        kwarn!("AHCI: port engine refused to stop");
    }

    /// Starts FIS receive and command processing once the command list
    /// is no longer running.
    fn start_engine(&mut self) {
        for _ in 0..SPIN_TIMEOUT {
            if self.read(regs::PORT_CMD) & PortCmd::CR.bits() == 0 {
                break;
            }
            core::hint::spin_loop();
        }
        let cmd = self.read(regs::PORT_CMD);
        self.write(regs::PORT_CMD, cmd | PortCmd::FRE.bits());
        let cmd = self.read(regs::PORT_CMD);
        self.write(regs::PORT_CMD, cmd | PortCmd::ST.bits());
    }

    fn header_ptr(&self, slot: u8) -> *mut CommandHeader {
        let virt = temp::kernel_alias(self.control_phys + u64::from(slot) * 32);
        virt.as_mut_ptr()
    }

    fn table_ptr(&self, slot: u8) -> *mut CommandTable {
        let virt = temp::kernel_alias(
            self.tables_phys + u64::from(slot) * core::mem::size_of::<CommandTable>() as u64,
        );
        virt.as_mut_ptr()
    }

    fn read(&self, offset: u64) -> u32 {
        // SAFETY: `init` requires a mapped port register block.
        unsafe { core::ptr::read_volatile((self.regs.as_u64() + offset) as *const u32) }
    }

    fn write(&self, offset: u64, value: u32) {
        // SAFETY: same as `read`.
        unsafe { core::ptr::write_volatile((self.regs.as_u64() + offset) as *mut u32, value) };
    }
}

// ---------------------------------------------------------------------------
// Sector-granular I/O on top of the command engine
// ---------------------------------------------------------------------------

impl super::rw::SectorIo for AhciPort {
    fn sector_size(&self) -> u64 {
        self.identity.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.identity.sector_count
    }

    fn read_aligned(&mut self, offset: u64, size: u64, buffer: &mut [u8]) -> bool {
        self.transfer(offset, size, buffer.as_mut_ptr() as u64, false)
    }

    fn write_aligned(&mut self, offset: u64, size: u64, buffer: &[u8]) -> bool {
        self.transfer(offset, size, buffer.as_ptr() as u64, true)
    }
}

impl AhciPort {
    /// Issues one or more DMA commands covering `size` bytes at device
    /// byte `offset` from the virtual buffer at `buffer_virt`. The PRDT
    /// builder decides how much each command covers; the loop continues
    /// until the request is done.
    fn transfer(&mut self, offset: u64, size: u64, buffer_virt: u64, write: bool) -> bool {
        let sector_size = self.identity.sector_size;
        if offset % sector_size != 0 || size % sector_size != 0 {
            return false;
        }
        if (offset + size) / sector_size > self.identity.sector_count {
            return false;
        }

        let command = if write {
            regs::ATA_CMD_WRITE_DMA_EXT
        } else {
            regs::ATA_CMD_READ_DMA_EXT
        };

        let mut done = 0u64;
        while done < size {
            let mut runs = [PrdtRun { phys: 0, bytes: 0 }; PRDT_ENTRIES];
            let plan = prdt::build(
                buffer_virt + done,
                size - done,
                &|virt| memory::translate(VirtAddr::new(virt)),
                &mut runs,
            );
            // A partial last sector cannot be submitted; a buffer the
            // tables cannot describe at all is an error.
            let covered = plan.bytes_covered - plan.bytes_covered % sector_size;
            if covered == 0 {
                return false;
            }

            let lba = (offset + done) / sector_size;
            let sectors = (covered / sector_size) as u16;
            if self
                .issue(command, lba, sectors, write, &runs[..plan.entries])
                .is_err()
            {
                return false;
            }
            done += covered;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_signatures() {
        assert_eq!(DeviceKind::from_signature(0x0000_0101), DeviceKind::Sata);
        assert_eq!(DeviceKind::from_signature(0xEB14_0101), DeviceKind::Satapi);
        assert_eq!(DeviceKind::from_signature(0xC33C_0101), DeviceKind::Semb);
        assert_eq!(
            DeviceKind::from_signature(0x9669_0101),
            DeviceKind::PortMultiplier
        );
        assert_eq!(DeviceKind::from_signature(0xDEAD_BEEF), DeviceKind::Unknown);
    }

    fn identify_block(lba48: u64, lba28: u32, w106: u16, sector_words: u32) -> [u8; 512] {
        let mut data = [0u8; 512];
        data[200..208].copy_from_slice(&lba48.to_le_bytes());
        data[120..124].copy_from_slice(&lba28.to_le_bytes());
        data[212..214].copy_from_slice(&w106.to_le_bytes());
        data[234..238].copy_from_slice(&sector_words.to_le_bytes());
        data
    }

    #[test]
    fn identify_prefers_lba48() {
        let data = identify_block(0x10_0000, 0xFFFF, 0, 0);
        let identity = parse_identify(&data);
        assert_eq!(identity.sector_count, 0x10_0000);
        assert!(identity.lba48);
        assert_eq!(identity.sector_size, 512);
    }

    #[test]
    fn identify_falls_back_to_lba28() {
        let data = identify_block(0, 0x3FFF, 0, 0);
        let identity = parse_identify(&data);
        assert_eq!(identity.sector_count, 0x3FFF);
        assert!(!identity.lba48);
    }

    #[test]
    fn identify_reads_large_logical_sectors() {
        // Word 106: valid (bit 14), logical-sector-size field present
        // (bit 12); words 117/118: 2048 words = 4096 bytes.
        let w106 = (1 << 14) | (1 << 12);
        let data = identify_block(0x1000, 0, w106, 2048);
        let identity = parse_identify(&data);
        assert_eq!(identity.sector_size, 4096);
    }

    #[test]
    fn identify_defaults_to_512_when_descriptor_invalid() {
        // Bit 15 set makes the word invalid.
        let w106 = (1 << 15) | (1 << 14) | (1 << 12);
        let data = identify_block(0x1000, 0, w106, 2048);
        assert_eq!(parse_identify(&data).sector_size, 512);
    }
}
