/* ---------------------------------------------------------------------------
    marigold kernel
    Copyright (C) 2026 janicria

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
--------------------------------------------------------------------------- */

/*!
    libmem/src/lib.rs

    The kernel heap: a buddy allocator handing out power-of-two blocks,
    slab caches carved out of buddy pages, and the kmalloc front end.
*/

#![cfg_attr(not(test), no_std)]

pub use buddy::{BuddyAllocator, BuddyStats, HeapInitError};
pub use debug::{Allocation, LeakTracker};
pub use kmalloc::{Heap, HeapStats};
pub use slab::{SlabCache, SlabStats};

/// Power-of-two block allocator.
pub mod buddy;

/// Canaries and leak tracking for debug heaps.
pub mod debug;

/// Per-size object caches.
pub mod slab;

/// One set of slab caches per CPU.
pub mod percpu;

/// The kmalloc / kfree front end.
pub mod kmalloc;

/// Size of a page, the unit slabs are made of.
pub const PAGE_SIZE: usize = 1 << PAGE_ORDER;

/// Order of a single page.
pub const PAGE_ORDER: usize = 12;

/// Order of the smallest block the buddy allocator hands out (32 bytes).
pub const MIN_ORDER: usize = 5;

/// Order of the largest block the buddy allocator hands out (2 MiB).
pub const MAX_ORDER: usize = 21;

/// Size of the smallest buddy block.
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_ORDER;

/// Rounds `val` up to the next multiple of `align`, which must be a power of two.
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Returns the smallest order whose block can hold `size` bytes, if any.
pub const fn size_to_order(size: usize) -> Option<usize> {
    if size > 1 << MAX_ORDER {
        return None;
    }

    let mut order = MIN_ORDER;
    while (1 << order) < size {
        order += 1;
    }
    Some(order)
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that sizes round up to the correct order.
    #[test]
    fn orders_round_up() {
        assert_eq!(size_to_order(0), Some(MIN_ORDER));
        assert_eq!(size_to_order(32), Some(5));
        assert_eq!(size_to_order(33), Some(6));
        assert_eq!(size_to_order(PAGE_SIZE), Some(PAGE_ORDER));
        assert_eq!(size_to_order(1 << MAX_ORDER), Some(MAX_ORDER));
        assert_eq!(size_to_order((1 << MAX_ORDER) + 1), None);
        assert_eq!(align_up(17, 16), 32)
    }
}
