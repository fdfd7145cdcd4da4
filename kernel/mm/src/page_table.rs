//! Four-level page-table editor.
//!
//! [`PageTables`] edits an x86-64 PML4 hierarchy through a physical
//! window: table frames at physical address `p` are dereferenced at
//! `window_base + p`. During early boot the window base is 0 (the boot
//! stub's identity map); once the linear window exists the kernel
//! re-opens the hierarchy through it. Hosted tests point the window at a
//! buffer and hand-roll the frames.
//!
//! Intermediate tables are allocated through a caller-supplied closure
//! and are never freed; a table frame, once wired in, lives for the rest
//! of the kernel. The only user-visible mutation is a leaf's present bit
//! flipping, and leaf writes are aligned 64-bit stores.
//!
//! TLB invalidation goes through a registered hook so that host tests
//! (where `invlpg` does not exist) run the same code path.

use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;
use talos_core::PAGE_SIZE;
use talos_core::addr::VirtAddr;

use crate::MapError;

bitflags! {
    /// Raw page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// Entry is valid.
        const PRESENT       = 1 << 0;
        /// Writes allowed.
        const WRITABLE      = 1 << 1;
        /// Ring-3 access allowed.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED      = 1 << 5;
        /// Set by hardware on write.
        const DIRTY         = 1 << 6;
        /// 1 GiB leaf in the PDPT, 2 MiB leaf in the PD.
        const HUGE          = 1 << 7;
        /// Survives CR3 reloads.
        const GLOBAL        = 1 << 8;
        /// Instruction fetch disallowed (needs EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical-address bits of an entry (bits 12..51).
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Byte span of a 1 GiB leaf.
const HUGE_1G_SPAN: u64 = 1 << 30;

/// Byte span of a 2 MiB leaf.
const HUGE_2M_SPAN: u64 = 1 << 21;

/// One page-table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// An empty, not-present entry.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry pointing at `phys` with `flags`.
    #[must_use]
    pub const fn new(phys: u64, flags: EntryFlags) -> Self {
        Self((phys & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the present bit is set.
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address.
    #[must_use]
    pub const fn address(self) -> u64 {
        self.0 & ENTRY_ADDR_MASK
    }

    /// Returns the flag bits.
    #[must_use]
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !ENTRY_ADDR_MASK)
    }
}

/// Requested properties of a 4 KiB mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Writes allowed.
    pub writable: bool,
    /// Ring-3 access allowed.
    pub user: bool,
    /// Write-through caching.
    pub write_through: bool,
    /// Caching disabled.
    pub cache_disable: bool,
    /// Instruction fetch disallowed.
    pub no_execute: bool,
}

impl MapOptions {
    /// Kernel-only read-write data.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self {
            writable: true,
            user: false,
            write_through: false,
            cache_disable: false,
            no_execute: true,
        }
    }

    /// Kernel-only uncached MMIO.
    #[must_use]
    pub const fn kernel_mmio() -> Self {
        Self {
            writable: true,
            user: false,
            write_through: true,
            cache_disable: true,
            no_execute: true,
        }
    }

    fn entry_flags(self) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT;
        if self.writable {
            flags |= EntryFlags::WRITABLE;
        }
        if self.user {
            flags |= EntryFlags::USER;
        }
        if self.write_through {
            flags |= EntryFlags::WRITE_THROUGH;
        }
        if self.cache_disable {
            flags |= EntryFlags::CACHE_DISABLE;
        }
        if self.no_execute {
            flags |= EntryFlags::NO_EXECUTE;
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// TLB flush hook
// ---------------------------------------------------------------------------

fn nop_flush(_virt: u64) {}

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(u64) as *mut ());

/// Registers the TLB single-page invalidation function. The kernel
/// installs `invlpg` here during boot; before that (and on the host) the
/// flush is a no-op, which is sound because no stale entries can exist
/// yet.
pub fn register_tlb_flush(f: fn(u64)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

fn flush_page(virt: u64) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: only valid `fn(u64)` pointers are stored in TLB_FLUSH_FN.
    let f: fn(u64) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

// ---------------------------------------------------------------------------
// PageTables
// ---------------------------------------------------------------------------

/// An editable view of a 4-level page-table hierarchy.
pub struct PageTables {
    root_phys: u64,
    window_base: u64,
}

/// Closure that hands out zeroed 4 KiB frames for intermediate tables.
pub type TableFrameSource<'a> = &'a mut dyn FnMut() -> Option<u64>;

impl PageTables {
    /// Opens the hierarchy rooted at `root_phys`, reaching table frames
    /// through `window_base`.
    ///
    /// # Safety
    ///
    /// `root_phys` must be a valid level-4 table and `window_base + p`
    /// must dereference physical address `p` for every table frame in
    /// the hierarchy.
    #[must_use]
    pub unsafe fn new(root_phys: u64, window_base: u64) -> Self {
        Self {
            root_phys: root_phys & ENTRY_ADDR_MASK,
            window_base,
        }
    }

    /// Physical address of the level-4 table.
    #[must_use]
    pub fn root_phys(&self) -> u64 {
        self.root_phys
    }

    /// Maps the 4 KiB page at `virt` to `phys`.
    ///
    /// Missing intermediate tables are drawn from `alloc` (which must
    /// return zeroed frames) and wired writable + user so leaf flags
    /// alone decide access. The mapped page's TLB entry is invalidated.
    ///
    /// # Errors
    ///
    /// [`MapError::OutOfMemory`] when `alloc` fails,
    /// [`MapError::HugeLeaf`] when a huge leaf already covers `virt`.
    pub fn map(
        &mut self,
        phys: u64,
        virt: VirtAddr,
        options: MapOptions,
        alloc: TableFrameSource<'_>,
    ) -> Result<(), MapError> {
        let l3 = self.descend(self.root_phys, virt.l4_index(), alloc)?;
        let l2 = self.descend(l3, virt.l3_index(), alloc)?;
        let l1 = self.descend(l2, virt.l2_index(), alloc)?;

        let entry = Entry::new(phys & !(PAGE_SIZE - 1), options.entry_flags());
        self.write_entry(l1, virt.l1_index(), entry);
        flush_page(virt.as_u64());
        Ok(())
    }

    /// Unmaps whatever leaf covers `virt`: a 4 KiB entry, or the 1 GiB /
    /// 2 MiB huge leaf containing it. Missing tables short-circuit; the
    /// intermediate tables themselves are never reclaimed.
    pub fn unmap(&mut self, virt: VirtAddr) {
        let root_entry = self.read_entry(self.root_phys, virt.l4_index());
        if !root_entry.present() {
            return;
        }
        let l3 = root_entry.address();

        let l3_entry = self.read_entry(l3, virt.l3_index());
        if !l3_entry.present() {
            return;
        }
        if l3_entry.flags().contains(EntryFlags::HUGE) {
            self.clear_present(l3, virt.l3_index());
            flush_page(virt.as_u64());
            return;
        }
        let l2 = l3_entry.address();

        let l2_entry = self.read_entry(l2, virt.l2_index());
        if !l2_entry.present() {
            return;
        }
        if l2_entry.flags().contains(EntryFlags::HUGE) {
            self.clear_present(l2, virt.l2_index());
            flush_page(virt.as_u64());
            return;
        }
        let l1 = l2_entry.address();

        self.clear_present(l1, virt.l1_index());
        flush_page(virt.as_u64());
    }

    /// Translates `virt` to its physical address, honoring huge leaves
    /// at levels 3 and 2. Returns 0 when the address is not mapped.
    #[must_use]
    pub fn translate(&self, virt: VirtAddr) -> u64 {
        let root_entry = self.read_entry(self.root_phys, virt.l4_index());
        if !root_entry.present() {
            return 0;
        }

        let l3_entry = self.read_entry(root_entry.address(), virt.l3_index());
        if !l3_entry.present() {
            return 0;
        }
        if l3_entry.flags().contains(EntryFlags::HUGE) {
            return l3_entry.address() + (virt.as_u64() & (HUGE_1G_SPAN - 1));
        }

        let l2_entry = self.read_entry(l3_entry.address(), virt.l2_index());
        if !l2_entry.present() {
            return 0;
        }
        if l2_entry.flags().contains(EntryFlags::HUGE) {
            return l2_entry.address() + (virt.as_u64() & (HUGE_2M_SPAN - 1));
        }

        let l1_entry = self.read_entry(l2_entry.address(), virt.l1_index());
        if !l1_entry.present() {
            return 0;
        }
        l1_entry.address() + virt.page_offset()
    }

    /// Installs the linear physical window: 512 one-GiB leaves mapping
    /// physical `0..512 GiB` at `base`, writable, write-through,
    /// cache-disabled, kernel-only.
    ///
    /// # Errors
    ///
    /// [`MapError::OutOfMemory`] when the level-3 table frame cannot be
    /// allocated.
    pub fn install_linear_window(
        &mut self,
        base: VirtAddr,
        alloc: TableFrameSource<'_>,
    ) -> Result<(), MapError> {
        let l3 = self.descend(self.root_phys, base.l4_index(), alloc)?;
        let flags = EntryFlags::PRESENT
            | EntryFlags::WRITABLE
            | EntryFlags::WRITE_THROUGH
            | EntryFlags::CACHE_DISABLE
            | EntryFlags::HUGE;
        for i in 0..512u64 {
            self.write_entry(l3, i as usize, Entry::new(i * HUGE_1G_SPAN, flags));
            flush_page(base.as_u64() + i * HUGE_1G_SPAN);
        }
        Ok(())
    }

    /// Returns the physical address of the table one level down from
    /// `table[index]`, creating it when `index` is empty.
    fn descend(
        &mut self,
        table: u64,
        index: usize,
        alloc: TableFrameSource<'_>,
    ) -> Result<u64, MapError> {
        let entry = self.read_entry(table, index);
        if entry.present() {
            if entry.flags().contains(EntryFlags::HUGE) {
                return Err(MapError::HugeLeaf);
            }
            return Ok(entry.address());
        }

        let frame = alloc().ok_or(MapError::OutOfMemory)?;
        self.zero_frame(frame);
        // Intermediate entries are permissive; the leaf decides.
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
        self.write_entry(table, index, Entry::new(frame, flags));
        Ok(frame)
    }

    fn entry_ptr(&self, table_phys: u64, index: usize) -> *mut u64 {
        (self.window_base + table_phys + (index as u64) * 8) as *mut u64
    }

    fn read_entry(&self, table_phys: u64, index: usize) -> Entry {
        // SAFETY: table frames are inside the window per `new`.
        Entry(unsafe { core::ptr::read_volatile(self.entry_ptr(table_phys, index)) })
    }

    fn write_entry(&self, table_phys: u64, index: usize, entry: Entry) {
        // SAFETY: table frames are inside the window per `new`. The
        // store is a single aligned 64-bit write.
        unsafe { core::ptr::write_volatile(self.entry_ptr(table_phys, index), entry.0) };
    }

    fn clear_present(&self, table_phys: u64, index: usize) {
        let entry = self.read_entry(table_phys, index);
        self.write_entry(table_phys, index, Entry(entry.0 & !1));
    }

    fn zero_frame(&self, phys: u64) {
        let ptr = (self.window_base + phys) as *mut u8;
        // SAFETY: the frame is inside the window and freshly allocated.
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_core::align_up;

    /// A little arena of page frames standing in for physical memory.
    struct Arena {
        _buffer: Vec<u8>,
        base: u64,
        next: u64,
        limit: u64,
    }

    impl Arena {
        fn new(frames: u64) -> Self {
            let buffer = vec![0u8; ((frames + 1) * PAGE_SIZE) as usize];
            let base = align_up(buffer.as_ptr() as u64, PAGE_SIZE);
            Self {
                _buffer: buffer,
                base,
                next: 0,
                limit: frames,
            }
        }

        /// Fake physical frame addresses are simple page offsets.
        fn alloc(&mut self) -> Option<u64> {
            if self.next == self.limit {
                return None;
            }
            let frame = self.next * PAGE_SIZE;
            self.next += 1;
            Some(frame)
        }
    }

    fn tables(arena: &mut Arena) -> PageTables {
        let root = arena.alloc().unwrap();
        // SAFETY: the arena buffer backs every fake physical frame.
        let tables = unsafe { PageTables::new(root, arena.base) };
        tables.zero_frame(root);
        tables
    }

    #[test]
    fn map_translate_roundtrip() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        let virt = VirtAddr::new(0x6000_0000_0000);
        tables
            .map(0xCAFE000, virt, MapOptions::kernel_rw(), &mut alloc)
            .unwrap();

        assert_eq!(tables.translate(VirtAddr::new(0x6000_0000_0777)), 0xCAFE777);
    }

    #[test]
    fn unmap_clears_translation() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        let virt = VirtAddr::new(0x6000_0000_0000);
        tables
            .map(0xCAFE000, virt, MapOptions::kernel_rw(), &mut alloc)
            .unwrap();
        tables.unmap(virt);

        assert_eq!(tables.translate(VirtAddr::new(0x6000_0000_0777)), 0);
    }

    #[test]
    fn unmapped_address_translates_to_zero() {
        let mut arena = Arena::new(16);
        let tables = tables(&mut arena);
        assert_eq!(tables.translate(VirtAddr::new(0x1234_5000)), 0);
    }

    #[test]
    fn intermediate_tables_survive_unmap() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        let virt = VirtAddr::new(0x10_0000_0000);
        tables
            .map(0x5000, virt, MapOptions::kernel_rw(), &mut alloc)
            .unwrap();
        let used_after_map = {
            // Remap the same page: no new intermediate frames may be
            // drawn.
            tables
                .map(0x6000, virt, MapOptions::kernel_rw(), &mut alloc)
                .unwrap();
            arena.next
        };
        tables.unmap(virt);
        tables
            .map(0x7000, virt, MapOptions::kernel_rw(), &mut || arena.alloc())
            .unwrap();
        assert_eq!(arena.next, used_after_map);
        assert_eq!(tables.translate(virt), 0x7000);
    }

    #[test]
    fn map_reports_out_of_memory() {
        let mut arena = Arena::new(2);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        let result = tables.map(
            0x1000,
            VirtAddr::new(0x6000_0000_0000),
            MapOptions::kernel_rw(),
            &mut alloc,
        );
        assert_eq!(result, Err(MapError::OutOfMemory));
    }

    #[test]
    fn huge_1g_leaf_translation() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        tables
            .install_linear_window(VirtAddr::new(0x6000_0000_0000), &mut alloc)
            .unwrap();

        // 96 TiB + 5 GiB + 0x1234 maps to 5 GiB + 0x1234.
        let virt = VirtAddr::new(0x6000_0000_0000 + 5 * (1 << 30) + 0x1234);
        assert_eq!(tables.translate(virt), 5 * (1 << 30) + 0x1234);
    }

    #[test]
    fn huge_leaf_unmap_clears_whole_leaf() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        tables
            .install_linear_window(VirtAddr::new(0x6000_0000_0000), &mut alloc)
            .unwrap();
        tables.unmap(VirtAddr::new(0x6000_0000_0000));
        assert_eq!(tables.translate(VirtAddr::new(0x6000_0000_0123)), 0);
        // The neighboring gigabyte is untouched.
        let next = VirtAddr::new(0x6000_4000_0000);
        assert_eq!(tables.translate(next), 1 << 30);
    }

    #[test]
    fn huge_2m_leaf_translation() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        // Build the path by mapping a 4 KiB page, then swap the L2
        // entry for a 2 MiB leaf by hand.
        let virt = VirtAddr::new(0x4000_0000_0000);
        tables
            .map(0x1000, virt, MapOptions::kernel_rw(), &mut alloc)
            .unwrap();

        let l3 = tables.read_entry(tables.root_phys, virt.l4_index()).address();
        let l2 = tables.read_entry(l3, virt.l3_index()).address();
        tables.write_entry(
            l2,
            virt.l2_index(),
            Entry::new(
                0x40_0000,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::HUGE,
            ),
        );

        assert_eq!(
            tables.translate(VirtAddr::new(0x4000_0000_1777)),
            0x40_0000 + 0x1777
        );
    }

    #[test]
    fn mapping_under_huge_leaf_is_rejected() {
        let mut arena = Arena::new(16);
        let mut tables = tables(&mut arena);
        let mut alloc = || arena.alloc();

        tables
            .install_linear_window(VirtAddr::new(0x6000_0000_0000), &mut alloc)
            .unwrap();
        let result = tables.map(
            0x1000,
            VirtAddr::new(0x6000_0000_0000),
            MapOptions::kernel_rw(),
            &mut || arena.alloc(),
        );
        assert_eq!(result, Err(MapError::HugeLeaf));
    }

    #[test]
    fn entry_flag_encoding() {
        let entry = Entry::new(
            0xABC000,
            MapOptions {
                writable: true,
                user: true,
                write_through: true,
                cache_disable: true,
                no_execute: true,
            }
            .entry_flags(),
        );
        assert!(entry.present());
        assert_eq!(entry.address(), 0xABC000);
        let flags = entry.flags();
        assert!(flags.contains(EntryFlags::WRITABLE));
        assert!(flags.contains(EntryFlags::USER));
        assert!(flags.contains(EntryFlags::WRITE_THROUGH));
        assert!(flags.contains(EntryFlags::CACHE_DISABLE));
        assert!(flags.contains(EntryFlags::NO_EXECUTE));
        assert!(!flags.contains(EntryFlags::HUGE));
    }
}
