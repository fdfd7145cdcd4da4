//! The kernel's memory singletons.
//!
//! Owns the global frame allocator, the active page tables, and the
//! kernel heap, and wires them together behind the `alloc` crate's
//! global allocator. Initialization order is fixed: the page tables are
//! re-rooted through the linear window first, then the frame allocator
//! consumes the boot memory map, and from then on the heap can grow.

extern crate alloc;

use talos_core::addr::VirtAddr;
use talos_core::layout::HEAP_BASE;
use talos_core::sync::SpinLock;
use talos_mm::heap::{HeapBacking, KernelHeap};
use talos_mm::page_table::{MapOptions, PageTables};
use talos_mm::pmm::FrameAllocator;

static PMM: SpinLock<Option<FrameAllocator>> = SpinLock::new(None);
static TABLES: SpinLock<Option<PageTables>> = SpinLock::new(None);
static HEAP: SpinLock<KernelHeap> = SpinLock::new(KernelHeap::new(HEAP_BASE));

/// Frames handed to the page tables before the frame allocator exists.
/// Six is enough for the linear window's level-3 table plus the first
/// few kernel mappings.
#[cfg(target_os = "none")]
const BOOTSTRAP_FRAMES: usize = 6;

#[cfg(target_os = "none")]
#[repr(C, align(4096))]
struct BootstrapPool([u8; BOOTSTRAP_FRAMES * talos_core::PAGE_SIZE as usize]);

#[cfg(target_os = "none")]
struct PoolCell(core::cell::UnsafeCell<BootstrapPool>);

// SAFETY: only touched single-threaded during early boot.
#[cfg(target_os = "none")]
unsafe impl Sync for PoolCell {}

#[cfg(target_os = "none")]
static BOOTSTRAP_POOL: PoolCell = PoolCell(core::cell::UnsafeCell::new(BootstrapPool(
    [0; BOOTSTRAP_FRAMES * talos_core::PAGE_SIZE as usize],
)));

#[cfg(target_os = "none")]
static BOOTSTRAP_USED: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Brings up paging and the frame allocator.
///
/// Extends the boot stub's tables with the linear physical window at
/// 96 TiB (drawing intermediate frames from the static bootstrap pool),
/// reopens the hierarchy through that window, and hands the memory map
/// to the frame allocator.
///
/// # Safety
///
/// Must run once, on the bootstrap CPU, while the boot stub's identity
/// map is still active. `memory_map` must describe RAM truthfully.
#[cfg(target_os = "none")]
pub unsafe fn init(memory_map: &talos_multiboot2::MemoryMapTag<'_>) {
    use core::sync::atomic::Ordering;
    use talos_core::arch::x86_64::instructions;
    use talos_core::layout::LINEAR_BASE;
    use talos_core::{PAGE_SIZE, kinfo};
    use talos_mm::page_table::register_tlb_flush;

    register_tlb_flush(instructions::invalidate_page);

    let cr3 = instructions::read_cr3() & !0xFFF;

    // Stage 1: the stub's identity map doubles as the physical window.
    // SAFETY: CR3 names the live hierarchy; low memory is identity
    // mapped.
    let mut early = unsafe { PageTables::new(cr3, 0) };

    // The pool is a kernel static; resolve its frames through the
    // stub's tables up front so the allocation closure is borrow-free.
    let mut pool_frames = [0u64; BOOTSTRAP_FRAMES];
    for (index, frame) in pool_frames.iter_mut().enumerate() {
        let virt = BOOTSTRAP_POOL.0.get() as u64 + index as u64 * PAGE_SIZE;
        let phys = early.translate(VirtAddr::new(virt));
        assert!(phys != 0, "bootstrap pool frame not mapped");
        *frame = phys;
    }

    let mut pool_alloc = || {
        let index = BOOTSTRAP_USED.fetch_add(1, Ordering::AcqRel) as usize;
        pool_frames.get(index).copied()
    };
    early
        .install_linear_window(VirtAddr::new(LINEAR_BASE), &mut pool_alloc)
        .expect("bootstrap pool exhausted installing the linear window");

    // Stage 2: reopen the hierarchy through the window it just gained.
    // SAFETY: the linear window now aliases all table frames.
    let tables = unsafe { PageTables::new(cr3, LINEAR_BASE) };
    *TABLES.lock() = Some(tables);

    // Stage 3: the frame allocator takes over RAM.
    // SAFETY: the linear window reaches every physical frame in the map.
    let pmm = unsafe { FrameAllocator::new(LINEAR_BASE, memory_map.regions()) }
        .expect("no usable memory");
    kinfo!(
        "pmm: {} MiB usable, max address {:#x}",
        pmm.total_memory() >> 20,
        pmm.max_address()
    );
    *PMM.lock() = Some(pmm);

    // Stage 4: pull the kernel image and the AP trampoline out of the
    // free pool.
    // SAFETY: the linker provides both image bounds.
    let (image_start, image_end) = unsafe { kernel_image_bounds() };
    set_used(image_start, image_end - image_start);
    set_used(
        crate::interrupts::smp::AP_TRAMPOLINE_PHYS,
        PAGE_SIZE,
    );
}

/// Physical bounds of the loaded kernel image, from linker symbols.
///
/// # Safety
///
/// The linker script must define both symbols.
#[cfg(target_os = "none")]
unsafe fn kernel_image_bounds() -> (u64, u64) {
    unsafe extern "C" {
        static __kernel_phys_start: u8;
        static __kernel_phys_end: u8;
    }
    // SAFETY: the symbols are addresses, never dereferenced.
    unsafe {
        (
            core::ptr::addr_of!(__kernel_phys_start) as u64,
            core::ptr::addr_of!(__kernel_phys_end) as u64,
        )
    }
}

/// Removes `[start, start + length)` from the allocatable pool.
pub fn set_used(start: u64, length: u64) {
    if let Some(pmm) = PMM.lock().as_mut() {
        pmm.set_used(start, length);
    }
}

/// Allocates `count` physically contiguous frames.
#[must_use]
pub fn allocate_frames(count: u64) -> Option<u64> {
    PMM.lock().as_mut()?.allocate(count).ok()
}

/// Returns `count` frames starting at `phys` to the pool.
pub fn free_frames(phys: u64, count: u64) {
    if let Some(pmm) = PMM.lock().as_mut() {
        pmm.free(phys, count);
    }
}

/// Maps one kernel page in the live tables.
pub fn map_kernel_page(phys: u64, virt: VirtAddr, options: MapOptions) -> bool {
    let mut tables = TABLES.lock();
    let Some(tables) = tables.as_mut() else {
        return false;
    };
    let mut alloc = || PMM.lock().as_mut()?.allocate(1).ok();
    tables.map(phys, virt, options, &mut alloc).is_ok()
}

/// Unmaps one page from the live tables.
pub fn unmap_page(virt: VirtAddr) {
    if let Some(tables) = TABLES.lock().as_mut() {
        tables.unmap(virt);
    }
}

/// Translates a virtual address through the live tables; 0 if unmapped.
#[must_use]
pub fn translate(virt: VirtAddr) -> u64 {
    TABLES.lock().as_ref().map_or(0, |tables| tables.translate(virt))
}

// ---------------------------------------------------------------------------
// Heap plumbing
// ---------------------------------------------------------------------------

/// Adapter giving the heap frames and mappings from the singletons.
struct KernelBacking;

impl HeapBacking for KernelBacking {
    fn allocate_frames(&mut self, count: u64) -> Option<u64> {
        allocate_frames(count)
    }

    fn free_frame(&mut self, phys: u64) {
        free_frames(phys, 1);
    }

    fn map_page(&mut self, phys: u64, virt: u64) -> bool {
        map_kernel_page(phys, VirtAddr::new(virt), MapOptions::kernel_rw())
    }

    fn translate(&self, virt: u64) -> u64 {
        translate(VirtAddr::new(virt))
    }
}

/// Allocates `size` bytes from the kernel heap; null on exhaustion.
#[must_use]
pub fn kmalloc(size: u64) -> *mut u8 {
    HEAP.lock().allocate(size, &mut KernelBacking)
}

/// Frees a pointer from [`kmalloc`].
pub fn kfree(ptr: *mut u8) {
    HEAP.lock().free(ptr, &mut KernelBacking);
}

// ---------------------------------------------------------------------------
// Global allocator
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global_allocator {
    use core::alloc::{GlobalAlloc, Layout};

    use super::{kfree, kmalloc};
    use talos_core::align_up;

    /// `alloc` front end over the kernel heap. The heap hands out
    /// 8-aligned blocks as long as block sizes stay 8-aligned, which
    /// `alloc` below guarantees; stricter alignments are met by
    /// over-allocating and remembering the real block just before the
    /// aligned payload.
    struct KernelAllocator;

    const NATIVE_ALIGN: usize = 8;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let size = align_up(layout.size().max(1) as u64, NATIVE_ALIGN as u64);
            if layout.align() <= NATIVE_ALIGN {
                return kmalloc(size);
            }

            let raw = kmalloc(size + layout.align() as u64 + NATIVE_ALIGN as u64);
            if raw.is_null() {
                return raw;
            }
            let aligned = align_up(raw as u64 + NATIVE_ALIGN as u64, layout.align() as u64);
            // SAFETY: aligned - 8 is inside the over-allocated block.
            unsafe { ((aligned - NATIVE_ALIGN as u64) as *mut u64).write(raw as u64) };
            aligned as *mut u8
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if layout.align() <= NATIVE_ALIGN {
                kfree(ptr);
                return;
            }
            // SAFETY: `alloc` stored the real block address just below
            // the aligned payload.
            let raw = unsafe { ((ptr as u64 - NATIVE_ALIGN as u64) as *const u64).read() };
            kfree(raw as *mut u8);
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}
