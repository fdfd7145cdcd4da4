//! Memory management for the Talos kernel.
//!
//! Five pieces, from the bottom up:
//!
//! * [`pmm`] — the physical frame allocator. Owns every byte of RAM the
//!   bootloader reported; stores its own bookkeeping inside the free
//!   frames it manages, so it works before any heap exists.
//! * [`page_table`] — the four-level page-table editor: map, unmap,
//!   translate, plus the bootstrap that installs the linear physical
//!   window.
//! * [`temp`] — deterministic physical-to-virtual aliases: arithmetic
//!   for the kernel, mapped on demand for user-visible buffers.
//! * [`heap`] — the kernel small-object heap at 80 TiB.
//! * [`mapping`] — per-address-space mapping lists, loaded into and
//!   unloaded from the hardware tables page by page.
//!
//! Physical memory is reached exclusively through a *window base*: a
//! virtual offset added to a physical address. The kernel passes the
//! linear window at 96 TiB; hosted tests pass the address of a plain
//! buffer, which is what makes the whole crate testable with
//! `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod heap;
pub mod mapping;
pub mod page_table;
pub mod pmm;
pub mod temp;

pub use talos_core::PAGE_SIZE;

/// Physical allocator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No region can satisfy the request. Fatal at kernel use sites.
    OutOfMemory,
    /// More non-usable regions than fit in the head page. Fatal.
    TooManyRegions,
    /// The memory map contained no usable RAM. Fatal.
    NoUsableMemory,
}

/// Page-table editing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Allocating an intermediate table frame failed.
    OutOfMemory,
    /// The virtual address is covered by a huge leaf; 4 KiB granularity
    /// edits cannot touch it.
    HugeLeaf,
}
