//! Physical frame allocator.
//!
//! The allocator owns all RAM described by the bootloader memory map and
//! hands out 4 KiB frames. It needs no heap: each free region stores its
//! own descriptor *inside its first frame*, and the descriptors form a
//! singly linked list threaded through physical memory. A head record in
//! frame 0 anchors the list, and the same head page holds one packed
//! record per non-usable region so `free` can reject bogus addresses.
//!
//! Descriptors are reached by adding the *window base* to their physical
//! address: the linear window at 96 TiB in the kernel, a buffer address
//! in hosted tests.

use talos_core::{PAGE_SIZE, align_up};
use talos_multiboot2::{MemoryRegion, RegionKind};

use crate::PmmError;

/// Classification tag stored in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
enum DescriptorKind {
    /// Free for the taking.
    Unclaimed = 0,
    /// Firmware-owned or defective; never allocatable.
    Unusable = 1,
    /// Holds ACPI tables; readable but not allocatable.
    AcpiReclaimable = 2,
    /// The list head in frame 0.
    Ignore = 3,
}

/// One region descriptor. Lives either packed in the head page (head and
/// non-usable records) or in the first frame of the free region it
/// describes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct RegionDescriptor {
    /// First page index of the region.
    start_page: u64,
    /// Length in pages.
    page_count: u64,
    /// Classification (a [`DescriptorKind`] as u64).
    kind: u64,
    /// Physical address of the next unclaimed descriptor; 0 terminates.
    next_phys: u64,
}

const DESCRIPTOR_SIZE: u64 = core::mem::size_of::<RegionDescriptor>() as u64;

/// Physical address of the head record (frame 0, record 0).
const HEAD_PHYS: u64 = 0;

/// The physical frame allocator.
#[derive(Debug)]
pub struct FrameAllocator {
    /// Virtual offset added to a physical address to reach it.
    window_base: u64,
    /// Number of non-usable records packed after the head record.
    reserved_records: u64,
    /// Total usable pages reported by the memory map.
    total_pages: u64,
    /// Pages currently handed out (or consumed by `set_used`).
    used_pages: u64,
    /// Highest usable physical address, exclusive.
    max_address: u64,
}

impl FrameAllocator {
    /// Builds the allocator from a bootloader memory map.
    ///
    /// Writes the head page (frame 0) and one descriptor into the first
    /// frame of every usable region. A region starting at address 0
    /// loses its first page to the head page.
    ///
    /// # Errors
    ///
    /// [`PmmError::TooManyRegions`] when the non-usable records do not
    /// fit in the head page, [`PmmError::NoUsableMemory`] when the map
    /// has no usable RAM.
    ///
    /// # Safety
    ///
    /// `window_base + p` must be valid writable memory for every
    /// physical address `p` in the map, and the map's regions must be
    /// disjoint and sorted by base address.
    pub unsafe fn new(
        window_base: u64,
        regions: impl Iterator<Item = MemoryRegion> + Clone,
    ) -> Result<Self, PmmError> {
        let mut allocator = Self {
            window_base,
            reserved_records: 0,
            total_pages: 0,
            used_pages: 0,
            max_address: 0,
        };

        let reserved = regions
            .clone()
            .filter(|r| r.kind != RegionKind::Available)
            .count() as u64;
        if (reserved + 1) * DESCRIPTOR_SIZE > PAGE_SIZE {
            return Err(PmmError::TooManyRegions);
        }
        allocator.reserved_records = reserved;

        allocator.write_descriptor(
            HEAD_PHYS,
            RegionDescriptor {
                start_page: 0,
                page_count: 0,
                kind: DescriptorKind::Ignore as u64,
                next_phys: 0,
            },
        );

        // Pack the non-usable records behind the head record.
        let mut record = 1;
        for region in regions.clone().filter(|r| r.kind != RegionKind::Available) {
            let kind = if region.kind == RegionKind::AcpiReclaimable {
                DescriptorKind::AcpiReclaimable
            } else {
                DescriptorKind::Unusable
            };
            allocator.write_descriptor(
                record * DESCRIPTOR_SIZE,
                RegionDescriptor {
                    start_page: region.base / PAGE_SIZE,
                    page_count: region.length / PAGE_SIZE,
                    kind: kind as u64,
                    next_phys: 0,
                },
            );
            record += 1;
        }

        // Thread a descriptor through the first frame of each usable
        // region.
        let mut tail = HEAD_PHYS;
        for region in regions.filter(|r| r.kind == RegionKind::Available) {
            let mut base = region.base;
            let mut length = region.length;
            if base == 0 {
                // Frame 0 is the head page.
                base += PAGE_SIZE;
                length = length.saturating_sub(PAGE_SIZE);
            }
            let page_count = length / PAGE_SIZE;
            if page_count == 0 {
                continue;
            }

            allocator.write_descriptor(
                base,
                RegionDescriptor {
                    start_page: base / PAGE_SIZE,
                    page_count,
                    kind: DescriptorKind::Unclaimed as u64,
                    next_phys: 0,
                },
            );
            let mut tail_desc = allocator.read_descriptor(tail);
            tail_desc.next_phys = base;
            allocator.write_descriptor(tail, tail_desc);
            tail = base;

            allocator.total_pages += page_count;
            if base + page_count * PAGE_SIZE > allocator.max_address {
                allocator.max_address = base + page_count * PAGE_SIZE;
            }
        }

        if allocator.total_pages == 0 {
            return Err(PmmError::NoUsableMemory);
        }
        Ok(allocator)
    }

    /// Allocates `count` contiguous frames and returns their physical
    /// address.
    ///
    /// Frames come from the *back* of the first region large enough, so
    /// the region's descriptor frame stays untouched until the region
    /// empties, at which point the descriptor is unlinked.
    ///
    /// # Errors
    ///
    /// [`PmmError::OutOfMemory`] when no region can satisfy the request.
    pub fn allocate(&mut self, count: u64) -> Result<u64, PmmError> {
        assert!(count > 0, "allocate of zero frames");

        let mut prev = HEAD_PHYS;
        let mut cur = self.read_descriptor(HEAD_PHYS).next_phys;
        while cur != 0 {
            let mut desc = self.read_descriptor(cur);
            if desc.page_count >= count {
                desc.page_count -= count;
                let phys = (desc.start_page + desc.page_count) * PAGE_SIZE;
                if desc.page_count == 0 {
                    let mut prev_desc = self.read_descriptor(prev);
                    prev_desc.next_phys = desc.next_phys;
                    self.write_descriptor(prev, prev_desc);
                } else {
                    self.write_descriptor(cur, desc);
                }
                self.used_pages += count;
                return Ok(phys);
            }
            prev = cur;
            cur = desc.next_phys;
        }
        Err(PmmError::OutOfMemory)
    }

    /// Returns `count` frames starting at `addr` to the free pool.
    ///
    /// Silently ignores frame 0, ranges overlapping non-usable regions,
    /// and ranges overlapping memory that is already free (double
    /// frees). After inserting, adjacent free regions are fused.
    pub fn free(&mut self, addr: u64, count: u64) {
        let page = addr / PAGE_SIZE;
        if page == 0 || count == 0 {
            return;
        }

        // Reject frames inside firmware-owned or ACPI memory.
        for record in 1..=self.reserved_records {
            let desc = self.read_descriptor(record * DESCRIPTOR_SIZE);
            if page < desc.start_page + desc.page_count && desc.start_page < page + count {
                return;
            }
        }

        // Reject overlap with memory that is already free.
        let mut cur = self.read_descriptor(HEAD_PHYS).next_phys;
        while cur != 0 {
            let desc = self.read_descriptor(cur);
            if page < desc.start_page + desc.page_count && desc.start_page < page + count {
                return;
            }
            cur = desc.next_phys;
        }

        // Insert a fresh descriptor, keeping the list sorted by start
        // page. Its home is the first freed frame.
        let mut prev = HEAD_PHYS;
        let mut cur = self.read_descriptor(HEAD_PHYS).next_phys;
        while cur != 0 {
            let desc = self.read_descriptor(cur);
            if desc.start_page > page {
                break;
            }
            prev = cur;
            cur = desc.next_phys;
        }
        self.write_descriptor(
            page * PAGE_SIZE,
            RegionDescriptor {
                start_page: page,
                page_count: count,
                kind: DescriptorKind::Unclaimed as u64,
                next_phys: cur,
            },
        );
        let mut prev_desc = self.read_descriptor(prev);
        prev_desc.next_phys = page * PAGE_SIZE;
        self.write_descriptor(prev, prev_desc);

        self.used_pages = self.used_pages.saturating_sub(count);
        self.coalesce();
    }

    /// Removes `[start, start + length)` from the free pool, page
    /// granular. Used at boot to reserve the kernel image and the
    /// real-mode trampoline.
    pub fn set_used(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let first = start / PAGE_SIZE;
        let last = align_up(start + length, PAGE_SIZE) / PAGE_SIZE;

        let mut prev = HEAD_PHYS;
        let mut cur = self.read_descriptor(HEAD_PHYS).next_phys;
        while cur != 0 {
            let mut desc = self.read_descriptor(cur);
            let region_first = desc.start_page;
            let region_last = desc.start_page + desc.page_count;
            let next = desc.next_phys;

            if last <= region_first || region_last <= first {
                // Disjoint.
                prev = cur;
                cur = next;
            } else if first <= region_first && region_last <= last {
                // Covered entirely: unlink.
                let mut prev_desc = self.read_descriptor(prev);
                prev_desc.next_phys = next;
                self.write_descriptor(prev, prev_desc);
                self.used_pages += region_last - region_first;
                cur = next;
            } else if first <= region_first {
                // Front trimmed: the descriptor moves to the new first
                // frame.
                let new_first = last;
                self.write_descriptor(
                    new_first * PAGE_SIZE,
                    RegionDescriptor {
                        start_page: new_first,
                        page_count: region_last - new_first,
                        kind: DescriptorKind::Unclaimed as u64,
                        next_phys: next,
                    },
                );
                let mut prev_desc = self.read_descriptor(prev);
                prev_desc.next_phys = new_first * PAGE_SIZE;
                self.write_descriptor(prev, prev_desc);
                self.used_pages += new_first - region_first;
                prev = new_first * PAGE_SIZE;
                cur = next;
            } else if region_last <= last {
                // Back trimmed.
                desc.page_count = first - region_first;
                self.write_descriptor(cur, desc);
                self.used_pages += region_last - first;
                prev = cur;
                cur = next;
            } else {
                // Interior cut: split in two; the upper half gets a new
                // descriptor in its first frame.
                desc.page_count = first - region_first;
                desc.next_phys = last * PAGE_SIZE;
                self.write_descriptor(cur, desc);
                self.write_descriptor(
                    last * PAGE_SIZE,
                    RegionDescriptor {
                        start_page: last,
                        page_count: region_last - last,
                        kind: DescriptorKind::Unclaimed as u64,
                        next_phys: next,
                    },
                );
                self.used_pages += last - first;
                prev = last * PAGE_SIZE;
                cur = next;
            }
        }
    }

    /// Total usable memory in bytes.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.total_pages * PAGE_SIZE
    }

    /// Memory currently handed out, in bytes.
    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.used_pages * PAGE_SIZE
    }

    /// Highest usable physical address, exclusive.
    #[must_use]
    pub fn max_address(&self) -> u64 {
        self.max_address
    }

    /// Counts the pages currently free by walking the region list.
    #[must_use]
    pub fn free_page_count(&self) -> u64 {
        let mut pages = 0;
        let mut cur = self.read_descriptor(HEAD_PHYS).next_phys;
        while cur != 0 {
            let desc = self.read_descriptor(cur);
            pages += desc.page_count;
            cur = desc.next_phys;
        }
        pages
    }

    /// Fuses abutting free regions until no two neighbors touch.
    fn coalesce(&mut self) {
        let mut cur = self.read_descriptor(HEAD_PHYS).next_phys;
        while cur != 0 {
            let mut desc = self.read_descriptor(cur);
            let next = desc.next_phys;
            if next == 0 {
                break;
            }
            let next_desc = self.read_descriptor(next);
            if desc.start_page + desc.page_count == next_desc.start_page {
                desc.page_count += next_desc.page_count;
                desc.next_phys = next_desc.next_phys;
                self.write_descriptor(cur, desc);
                // Stay put: three or more regions may abut.
            } else {
                cur = next;
            }
        }
    }

    fn read_descriptor(&self, phys: u64) -> RegionDescriptor {
        let ptr = (self.window_base + phys) as *const RegionDescriptor;
        // SAFETY: `new` requires the window to cover all mapped physical
        // memory, and descriptors are only ever placed inside it.
        unsafe { core::ptr::read_volatile(ptr) }
    }

    fn write_descriptor(&self, phys: u64, desc: RegionDescriptor) {
        let ptr = (self.window_base + phys) as *mut RegionDescriptor;
        // SAFETY: same as `read_descriptor`.
        unsafe { core::ptr::write_volatile(ptr, desc) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake physical address space: a page-aligned buffer whose base
    /// serves as the window base.
    struct PhysSpace {
        buffer: Vec<u8>,
    }

    impl PhysSpace {
        fn new(size: usize) -> Self {
            // Over-allocate so the base can be pushed up to a page
            // boundary.
            Self {
                buffer: vec![0u8; size + PAGE_SIZE as usize],
            }
        }

        fn base(&self) -> u64 {
            align_up(self.buffer.as_ptr() as u64, PAGE_SIZE)
        }
    }

    fn region(base: u64, length: u64, kind: RegionKind) -> MemoryRegion {
        MemoryRegion { base, length, kind }
    }

    /// The map from the boot scenario: 1 MiB of firmware memory, then
    /// 127 MiB of RAM, then one ACPI page.
    fn boot_map() -> Vec<MemoryRegion> {
        vec![
            region(0x0, 0x100000, RegionKind::Unusable),
            region(0x100000, 0x7F00000, RegionKind::Available),
            region(0x8000000, 0x1000, RegionKind::AcpiReclaimable),
        ]
    }

    fn boot_allocator(space: &PhysSpace) -> FrameAllocator {
        // SAFETY: the buffer covers the whole fake physical space.
        unsafe { FrameAllocator::new(space.base(), boot_map().into_iter()) }.unwrap()
    }

    #[test]
    fn carves_from_the_back() {
        let space = PhysSpace::new(0x8001000);
        let mut pmm = boot_allocator(&space);

        assert_eq!(pmm.allocate(2), Ok(0x7FFE000));
        assert_eq!(pmm.allocate(1), Ok(0x7FFD000));
        assert_eq!(pmm.total_memory(), 0x7F00000);
        assert_eq!(pmm.used_memory(), 3 * 0x1000);
    }

    #[test]
    fn drains_to_out_of_memory() {
        let space = PhysSpace::new(0x8001000);
        let mut pmm = boot_allocator(&space);

        assert_eq!(pmm.allocate(2), Ok(0x7FFE000));
        // Emptying the region hands back its descriptor frame last.
        assert_eq!(pmm.allocate(0x7EFE), Ok(0x100000));
        assert_eq!(pmm.allocate(1), Err(PmmError::OutOfMemory));
    }

    #[test]
    fn never_hands_out_unusable_or_overlapping_frames() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
            region(0x14000, 0x2000, RegionKind::Unusable),
            region(0x16000, 0x8000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        let mut held: Vec<(u64, u64)> = Vec::new();
        loop {
            match pmm.allocate(2) {
                Ok(addr) => held.push((addr, 2 * PAGE_SIZE)),
                Err(PmmError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }

        for &(addr, len) in &held {
            let inside_ram = (0x4000..0x14000).contains(&addr)
                && addr + len <= 0x14000
                || (0x16000..0x1E000).contains(&addr) && addr + len <= 0x1E000;
            assert!(inside_ram, "allocation {addr:#x} escaped usable RAM");
            for &(other, other_len) in &held {
                if (other, other_len) != (addr, len) {
                    assert!(
                        addr + len <= other || other + other_len <= addr,
                        "allocations overlap: {addr:#x} and {other:#x}"
                    );
                }
            }
        }
    }

    #[test]
    fn free_then_reallocate() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        let all = pmm.allocate(16).unwrap();
        assert_eq!(all, 0x4000);
        assert_eq!(pmm.allocate(1), Err(PmmError::OutOfMemory));

        pmm.free(all, 16);
        assert_eq!(pmm.allocate(16), Ok(0x4000));
    }

    #[test]
    fn freed_neighbors_coalesce() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        let all = pmm.allocate(16).unwrap();
        // Return the range in two halves, back half first; the halves
        // abut and must fuse into one region.
        pmm.free(all + 8 * PAGE_SIZE, 8);
        pmm.free(all, 8);
        assert_eq!(pmm.free_page_count(), 16);
        assert_eq!(pmm.allocate(16), Ok(0x4000));
    }

    #[test]
    fn double_free_is_ignored() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        let a = pmm.allocate(4).unwrap();
        pmm.free(a, 4);
        pmm.free(a, 4);
        assert_eq!(pmm.free_page_count(), 16);
    }

    #[test]
    fn free_of_unusable_memory_is_ignored() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
            region(0x14000, 0x1000, RegionKind::AcpiReclaimable),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        pmm.free(0x1000, 1); // firmware memory
        pmm.free(0x14000, 1); // ACPI table
        pmm.free(0x0, 1); // frame 0
        assert_eq!(pmm.free_page_count(), 16);
    }

    #[test]
    fn set_used_trims_the_front() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        // Reserve the first 4 pages of the region (e.g. a kernel image).
        pmm.set_used(0x4000, 0x4000);
        assert_eq!(pmm.free_page_count(), 12);
        // The relocated descriptor still works.
        assert_eq!(pmm.allocate(12), Ok(0x8000));
    }

    #[test]
    fn set_used_trims_the_back() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        pmm.set_used(0x10000, 0x4000);
        assert_eq!(pmm.free_page_count(), 12);
        assert_eq!(pmm.allocate(1), Ok(0xF000));
    }

    #[test]
    fn set_used_splits_interior_ranges() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        pmm.set_used(0x8000, 0x2000);
        assert_eq!(pmm.free_page_count(), 14);
        // Back of the upper half first, then the lower half.
        assert_eq!(pmm.allocate(10), Ok(0xA000));
        assert_eq!(pmm.allocate(4), Ok(0x4000));
        assert_eq!(pmm.allocate(1), Err(PmmError::OutOfMemory));
    }

    #[test]
    fn set_used_covers_whole_region() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x4000, RegionKind::Available),
            region(0x8000, 0x4000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        pmm.set_used(0x4000, 0x4000);
        assert_eq!(pmm.free_page_count(), 4);
        assert_eq!(pmm.allocate(4), Ok(0x8000));
    }

    #[test]
    fn set_used_of_unaligned_range_rounds_out() {
        let space = PhysSpace::new(0x40000);
        let map = vec![
            region(0x0, 0x4000, RegionKind::Unusable),
            region(0x4000, 0x10000, RegionKind::Available),
        ];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        // 0x8800..0x9100 touches pages 8 and 9.
        pmm.set_used(0x8800, 0x900);
        assert_eq!(pmm.free_page_count(), 14);
    }

    #[test]
    fn rejects_maps_without_ram() {
        let space = PhysSpace::new(0x8000);
        let map = vec![region(0x0, 0x8000, RegionKind::Unusable)];
        // SAFETY: buffer covers the space.
        let err = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap_err();
        assert_eq!(err, PmmError::NoUsableMemory);
    }

    #[test]
    fn region_starting_at_zero_loses_head_page() {
        let space = PhysSpace::new(0x10000);
        let map = vec![region(0x0, 0x8000, RegionKind::Available)];
        // SAFETY: buffer covers the space.
        let mut pmm = unsafe { FrameAllocator::new(space.base(), map.into_iter()) }.unwrap();

        assert_eq!(pmm.free_page_count(), 7);
        // Frame 0 is never handed out.
        for _ in 0..7 {
            assert_ne!(pmm.allocate(1), Ok(0));
        }
    }
}
