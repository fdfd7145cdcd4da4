//! Deterministic physical-to-virtual aliases.
//!
//! Kernel code gets an alias by pure arithmetic: the linear window at
//! 96 TiB covers the first 512 GiB of physical memory, so no state and
//! no allocations are needed — which is exactly what the frame allocator
//! and page-table code rely on before the heap exists.
//!
//! User-visible buffers instead get pages mapped on demand below the
//! 32 TiB arena, uncached and non-executable.

use talos_core::addr::VirtAddr;
use talos_core::layout::{LINEAR_BASE, LINEAR_SIZE, USER_WINDOW_BASE};
use talos_core::{PAGE_SIZE, kfatal};

use crate::MapError;
use crate::page_table::{MapOptions, PageTables, TableFrameSource};

/// Returns the kernel's virtual alias for physical address `phys`.
///
/// The low 12 bits pass through, so the alias of an unaligned address is
/// itself unaligned by the same amount. Halts on physical addresses the
/// linear window does not reach.
#[must_use]
pub fn kernel_alias(phys: u64) -> VirtAddr {
    if phys >= LINEAR_SIZE {
        kfatal!("temp: {:#x} is beyond the linear window", phys);
        talos_core::arch::x86_64::instructions::halt_loop();
    }
    VirtAddr::new(LINEAR_BASE + phys)
}

/// Maps `count` pages starting at the frame containing `phys` into the
/// user window and returns the user-visible alias of `phys`.
///
/// The alias is `32 TiB + phys`, so repeated calls for the same frames
/// are idempotent: already-correct translations are left alone. Pages
/// are mapped user-accessible, write-through, cache-disabled, and
/// non-executable.
///
/// # Errors
///
/// [`MapError::OutOfMemory`] when an intermediate table cannot be
/// allocated.
pub fn map_user_alias(
    tables: &mut PageTables,
    phys: u64,
    count: u64,
    alloc: TableFrameSource<'_>,
) -> Result<VirtAddr, MapError> {
    let phys_base = phys & !(PAGE_SIZE - 1);
    let options = MapOptions {
        writable: true,
        user: true,
        write_through: true,
        cache_disable: true,
        no_execute: true,
    };

    for i in 0..count {
        let page_phys = phys_base + i * PAGE_SIZE;
        let page_virt = VirtAddr::new(USER_WINDOW_BASE + page_phys);
        if tables.translate(page_virt) == page_phys && page_phys != 0 {
            continue;
        }
        tables.map(page_phys, page_virt, options, alloc)?;
    }

    Ok(VirtAddr::new(USER_WINDOW_BASE + phys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_core::align_up;

    #[test]
    fn kernel_alias_is_arithmetic() {
        assert_eq!(kernel_alias(0).as_u64(), LINEAR_BASE);
        assert_eq!(kernel_alias(0x1234).as_u64(), LINEAR_BASE + 0x1234);
        assert_eq!(
            kernel_alias(0xCAFE123).page_offset(),
            0x123,
            "low bits must pass through"
        );
    }

    #[test]
    #[should_panic]
    fn kernel_alias_rejects_out_of_window() {
        let _ = kernel_alias(LINEAR_SIZE);
    }

    struct Arena {
        _buffer: Vec<u8>,
        base: u64,
        next: u64,
    }

    impl Arena {
        fn new(frames: u64) -> Self {
            let buffer = vec![0u8; ((frames + 1) * PAGE_SIZE) as usize];
            let base = align_up(buffer.as_ptr() as u64, PAGE_SIZE);
            Self {
                _buffer: buffer,
                base,
                next: 0,
            }
        }

        fn alloc(&mut self) -> Option<u64> {
            let frame = self.next * PAGE_SIZE;
            self.next += 1;
            Some(frame)
        }
    }

    #[test]
    fn user_alias_maps_and_is_idempotent() {
        let mut arena = Arena::new(32);
        let root = arena.alloc().unwrap();
        // SAFETY: the arena buffer backs every fake frame.
        let mut tables = unsafe { PageTables::new(root, arena.base) };

        let virt = map_user_alias(&mut tables, 0x8000 + 0x123, 2, &mut || arena.alloc()).unwrap();
        assert_eq!(virt.as_u64(), USER_WINDOW_BASE + 0x8123);
        assert_eq!(
            tables.translate(VirtAddr::new(USER_WINDOW_BASE + 0x8000)),
            0x8000
        );
        assert_eq!(
            tables.translate(VirtAddr::new(USER_WINDOW_BASE + 0x9000)),
            0x9000
        );

        // Second call finds the translations in place and allocates
        // nothing further.
        let frames_used = arena.next;
        let again = map_user_alias(&mut tables, 0x8123, 2, &mut || arena.alloc()).unwrap();
        assert_eq!(again, virt);
        assert_eq!(arena.next, frames_used);
    }
}
