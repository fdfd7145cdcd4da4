//! The storage registry.
//!
//! Drivers register block devices here; the registry probes each new
//! device for an MBR and registers the non-empty partitions as
//! offset-windowed devices of their own. Ownership is strictly
//! top-down — the registry owns the devices, and a partition refers to
//! its parent by index, resolved at I/O time. No back-pointers, no
//! reference counting.

pub mod mbr;

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use talos_core::kinfo;
use talos_core::sync::SpinLock;

/// A block device as higher layers see it.
pub trait StorageDevice: Send {
    /// Device capacity in bytes.
    fn size_bytes(&self) -> u64;

    /// Reads `size` bytes at `offset` into `buffer`. Returns the bytes
    /// read, or -1 on failure.
    fn read(&mut self, offset: u64, size: u64, buffer: &mut [u8]) -> i64;

    /// Writes `size` bytes at `offset` from `buffer`. Returns the bytes
    /// written, or -1 on failure.
    fn write(&mut self, offset: u64, size: u64, buffer: &[u8]) -> i64;

    /// A short human-readable device type.
    fn type_name(&self) -> &'static str;
}

/// An index into the registry. Stable for the kernel's lifetime;
/// devices are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageHandle(usize);

enum Entry {
    Device(Box<dyn StorageDevice>),
    Partition {
        parent: usize,
        offset: u64,
        size: u64,
    },
}

static REGISTRY: SpinLock<Vec<Entry>> = SpinLock::new(Vec::new());

/// Registers a device, probes it for an MBR, and registers every
/// non-empty primary partition behind it.
pub fn register_device(device: Box<dyn StorageDevice>) -> StorageHandle {
    let mut entries = REGISTRY.lock();

    let size = device.size_bytes();
    let name = device.type_name();
    let index = entries.len();
    entries.push(Entry::Device(device));

    kinfo!(
        "storage: device {} ({}) registered, {} bytes",
        index,
        name,
        size
    );

    if size < 512 {
        return StorageHandle(index);
    }

    // MBR probe: read sector 0 through the registry path so partition
    // nesting and device I/O share one code path.
    let mut sector = [0u8; 512];
    if entry_read(&mut entries, index, 0, 512, &mut sector) != 512 {
        return StorageHandle(index);
    }
    let Some(partitions) = mbr::parse(&sector) else {
        return StorageHandle(index);
    };

    for partition in partitions.into_iter().flatten() {
        if partition.byte_offset() + partition.byte_length() > size {
            continue;
        }
        let part_index = entries.len();
        entries.push(Entry::Partition {
            parent: index,
            offset: partition.byte_offset(),
            size: partition.byte_length(),
        });
        kinfo!(
            "storage: partition {} on device {}: type {:#04x}, {} bytes{}",
            part_index,
            index,
            partition.kind,
            partition.byte_length(),
            if partition.bootable { ", bootable" } else { "" }
        );
    }

    StorageHandle(index)
}

/// Number of registered entries (devices and partitions).
#[must_use]
pub fn entry_count() -> usize {
    REGISTRY.lock().len()
}

/// Reads from the entry behind `handle`.
pub fn read(handle: StorageHandle, offset: u64, size: u64, buffer: &mut [u8]) -> i64 {
    let mut entries = REGISTRY.lock();
    entry_read(&mut entries, handle.0, offset, size, buffer)
}

/// Writes to the entry behind `handle`.
pub fn write(handle: StorageHandle, offset: u64, size: u64, buffer: &[u8]) -> i64 {
    let mut entries = REGISTRY.lock();
    entry_write(&mut entries, handle.0, offset, size, buffer)
}

/// Capacity of the entry behind `handle` in bytes.
#[must_use]
pub fn size_bytes(handle: StorageHandle) -> u64 {
    let entries = REGISTRY.lock();
    match entries.get(handle.0) {
        Some(Entry::Device(device)) => device.size_bytes(),
        Some(Entry::Partition { size, .. }) => *size,
        None => 0,
    }
}

/// Type name of the entry behind `handle`.
#[must_use]
pub fn type_name(handle: StorageHandle) -> &'static str {
    let entries = REGISTRY.lock();
    match entries.get(handle.0) {
        Some(Entry::Device(device)) => device.type_name(),
        Some(Entry::Partition { .. }) => "partition",
        None => "unknown",
    }
}

/// Resolves partition chains down to the owning device, then reads.
fn entry_read(entries: &mut [Entry], index: usize, offset: u64, size: u64, buffer: &mut [u8]) -> i64 {
    let (device_index, offset) = match resolve(entries, index, offset, size) {
        Some(resolved) => resolved,
        None => return -1,
    };
    match &mut entries[device_index] {
        Entry::Device(device) => device.read(offset, size, buffer),
        Entry::Partition { .. } => -1,
    }
}

/// Resolves partition chains down to the owning device, then writes.
fn entry_write(entries: &mut [Entry], index: usize, offset: u64, size: u64, buffer: &[u8]) -> i64 {
    let (device_index, offset) = match resolve(entries, index, offset, size) {
        Some(resolved) => resolved,
        None => return -1,
    };
    match &mut entries[device_index] {
        Entry::Device(device) => device.write(offset, size, buffer),
        Entry::Partition { .. } => -1,
    }
}

/// Follows `index` through any partition windows, bounds-checking each,
/// and returns the owning device index plus the adjusted offset.
fn resolve(entries: &[Entry], mut index: usize, mut offset: u64, size: u64) -> Option<(usize, u64)> {
    loop {
        match entries.get(index)? {
            Entry::Device(_) => return Some((index, offset)),
            Entry::Partition {
                parent,
                offset: window,
                size: window_size,
            } => {
                if offset + size > *window_size {
                    return None;
                }
                offset += window;
                index = *parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbr::tests::build_sector;
    use std::sync::{Mutex, MutexGuard};

    /// The registry is process-wide; tests take this to keep their
    /// index arithmetic stable.
    static REGISTRY_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn lock_registry() -> MutexGuard<'static, ()> {
        REGISTRY_TEST_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A RAM-backed disk with an optional MBR in sector 0.
    struct RamDisk {
        data: Vec<u8>,
    }

    impl RamDisk {
        fn blank(size: usize) -> Self {
            Self {
                data: vec![0u8; size],
            }
        }

        fn with_mbr(size: usize, entries: &[(bool, u8, u32, u32)]) -> Self {
            let mut disk = Self::blank(size);
            disk.data[..512].copy_from_slice(&build_sector(entries));
            disk
        }
    }

    impl StorageDevice for RamDisk {
        fn size_bytes(&self) -> u64 {
            self.data.len() as u64
        }

        fn read(&mut self, offset: u64, size: u64, buffer: &mut [u8]) -> i64 {
            if offset + size > self.data.len() as u64 {
                return -1;
            }
            buffer[..size as usize]
                .copy_from_slice(&self.data[offset as usize..(offset + size) as usize]);
            size as i64
        }

        fn write(&mut self, offset: u64, size: u64, buffer: &[u8]) -> i64 {
            if offset + size > self.data.len() as u64 {
                return -1;
            }
            self.data[offset as usize..(offset + size) as usize]
                .copy_from_slice(&buffer[..size as usize]);
            size as i64
        }

        fn type_name(&self) -> &'static str {
            "ram"
        }
    }

    #[test]
    fn registers_device_and_partitions() {
        let _registry = lock_registry();
        // 64 sectors; one partition covering sectors 8..24.
        let before = entry_count();
        let mut disk = RamDisk::with_mbr(64 * 512, &[(false, 0x83, 8, 16)]);
        // Recognizable bytes at the partition start.
        disk.data[8 * 512] = 0x5A;

        let handle = register_device(Box::new(disk));
        assert_eq!(entry_count(), before + 2);
        assert_eq!(type_name(handle), "ram");

        let partition = StorageHandle(handle.0 + 1);
        assert_eq!(size_bytes(partition), 16 * 512);
        assert_eq!(type_name(partition), "partition");

        // Partition offset 0 is device offset 8 * 512.
        let mut byte = [0u8; 1];
        assert_eq!(read(partition, 0, 1, &mut byte), 1);
        assert_eq!(byte[0], 0x5A);
    }

    #[test]
    fn partition_reads_are_bounds_checked() {
        let _registry = lock_registry();
        let disk = RamDisk::with_mbr(64 * 512, &[(false, 0x83, 8, 16)]);
        let handle = register_device(Box::new(disk));
        let partition = StorageHandle(handle.0 + 1);

        let mut buffer = [0u8; 512];
        assert_eq!(read(partition, 16 * 512 - 256, 512, &mut buffer), -1);
        assert_eq!(read(partition, 16 * 512, 1, &mut buffer[..1]), -1);
        assert_eq!(read(partition, 15 * 512, 512, &mut buffer), 512);
    }

    #[test]
    fn partition_writes_land_inside_the_window() {
        let _registry = lock_registry();
        let disk = RamDisk::with_mbr(64 * 512, &[(false, 0x83, 8, 16)]);
        let handle = register_device(Box::new(disk));
        let partition = StorageHandle(handle.0 + 1);

        let payload = [0xA5u8; 4];
        assert_eq!(write(partition, 512, 4, &payload), 4);

        // Visible through the raw device at the windowed offset.
        let mut check = [0u8; 4];
        assert_eq!(read(handle, 8 * 512 + 512, 4, &mut check), 4);
        assert_eq!(check, payload);
    }

    #[test]
    fn device_without_mbr_registers_alone() {
        let _registry = lock_registry();
        let before = entry_count();
        let disk = RamDisk::blank(16 * 512);
        register_device(Box::new(disk));
        assert_eq!(entry_count(), before + 1);
    }

    #[test]
    fn oversized_partition_entries_ignored() {
        let _registry = lock_registry();
        let before = entry_count();
        // Partition claims 1000 sectors on a 64-sector disk.
        let disk = RamDisk::with_mbr(64 * 512, &[(false, 0x83, 8, 1000)]);
        register_device(Box::new(disk));
        assert_eq!(entry_count(), before + 1);
    }
}
