//! The fixed virtual-memory layout of the kernel.
//!
//! Every subsystem that converts between physical and virtual addresses
//! agrees on these bases:
//!
//! | range                    | use                                        |
//! |--------------------------|--------------------------------------------|
//! | `0 .. 512 GiB`           | bootstrap identity map (boot stub only)    |
//! | `32 TiB ..`              | per-user temporary mapping arena           |
//! | `80 TiB ..`              | kernel heap arena                          |
//! | `96 TiB .. 96.5 TiB`     | linear window over the first 512 GiB of    |
//! |                          | physical memory, 1 GiB pages               |
//! | `CR3 + 96 TiB`           | alias of the live level-4 table            |

/// One tebibyte.
pub const TIB: u64 = 1 << 40;

/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// Base of the user-visible temporary mapping arena.
pub const USER_WINDOW_BASE: u64 = 32 * TIB;

/// Base of the kernel heap arena.
pub const HEAP_BASE: u64 = 80 * TIB;

/// Base of the kernel's linear window over physical memory.
pub const LINEAR_BASE: u64 = 96 * TIB;

/// Amount of physical memory covered by the linear window.
pub const LINEAR_SIZE: u64 = 512 * GIB;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bases() {
        assert_eq!(USER_WINDOW_BASE, 0x2000_0000_0000);
        assert_eq!(HEAP_BASE, 0x5000_0000_0000);
        assert_eq!(LINEAR_BASE, 0x6000_0000_0000);
        assert_eq!(LINEAR_SIZE, 0x80_0000_0000);
    }

    #[test]
    fn arenas_do_not_overlap() {
        assert!(USER_WINDOW_BASE + LINEAR_SIZE <= HEAP_BASE);
        assert!(HEAP_BASE < LINEAR_BASE);
    }
}
