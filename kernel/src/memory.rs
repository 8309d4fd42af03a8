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
    kernel/src/memory.rs

    Brings up the kernel heap from the bootloader's memory map
*/

use bootloader::{
    BootInfo,
    bootinfo::{MemoryRegion, MemoryRegionType},
};
use core::{fmt::Display, ptr::NonNull};
use libmem::{Heap, HeapInitError, HeapStats};
use libutil::{InitError, InitLater};

use crate::startup::{self, ExitCode};

/// What the bootloader passed to `kmain`.
pub static BOOT_INFO: InitLater<&'static BootInfo> = InitLater::uninit();

/// The kernel heap, also backs `alloc`.
#[global_allocator]
static HEAP: Heap = Heap::new();

/// Hands the largest usable region of memory to the heap.
///
/// # Safety
/// Only run once, after [`BOOT_INFO`] is set.
pub unsafe fn init() -> ExitCode<MemInitError> {
    let info = exit_on_err!(BOOT_INFO.read());

    let Some(region) = largest_usable(info.memory_map.iter()) else {
        return ExitCode::Error(MemInitError::NoUsableMemory);
    };

    let start = region.range.start_addr() as usize;
    let size = (region.range.end_addr() - region.range.start_addr()) as usize;

    // Safety: The bootloader marked the region as usable and maps all of physical
    // memory at physical_memory_offset
    let managed =
        exit_on_err!(unsafe { HEAP.init(start, size, info.physical_memory_offset as usize) });

    // Safety: Just initialised it above
    unsafe { startup::HEAP_INIT.store(true) }

    dbg_info!("heap: {} KiB at phys 0x{start:x}", managed / 1024);
    ExitCode::Ok
}

/// Returns the biggest usable region in `regions`.
fn largest_usable<'a>(regions: impl Iterator<Item = &'a MemoryRegion>) -> Option<&'a MemoryRegion> {
    regions
        .filter(|r| r.region_type == MemoryRegionType::Usable)
        .max_by_key(|r| r.range.end_addr() - r.range.start_addr())
}

/// Error returned from `init`.
pub enum MemInitError {
    NoBootInfo(InitError<&'static BootInfo>),
    NoUsableMemory,
    Heap(HeapInitError),
}

impl From<InitError<&'static BootInfo>> for MemInitError {
    fn from(e: InitError<&'static BootInfo>) -> Self {
        MemInitError::NoBootInfo(e)
    }
}

impl From<HeapInitError> for MemInitError {
    fn from(e: HeapInitError) -> Self {
        MemInitError::Heap(e)
    }
}

impl Display for MemInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemInitError::NoBootInfo(e) => write!(f, "{e}"),
            MemInitError::NoUsableMemory => write!(f, "The bootloader reported no usable memory"),
            MemInitError::Heap(e) => write!(f, "{e}"),
        }
    }
}

/// Allocates `size` bytes from the kernel heap, `None` if `size` is 0 or the heap is full.
#[track_caller]
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    HEAP.kmalloc(size)
}

/// Frees memory returned by [`kmalloc`], null is ignored.
///
/// # Safety
/// `ptr` must be null or from [`kmalloc`], and not used afterwards.
#[track_caller]
pub unsafe fn kfree(ptr: *mut u8) {
    // Safety: Ensured by caller
    unsafe { HEAP.kfree(ptr) }
}

/// Returns the heap's counters.
pub fn stats() -> HeapStats {
    HEAP.stats()
}

/// Returns empty slabs to the buddy allocator, returning how many were freed.
pub fn shrink() -> usize {
    HEAP.shrink()
}

/// Prints every tracked allocation which hasn't been freed yet.
///
/// Only `alloc_debug` builds track allocations.
pub fn dump_leaks() -> usize {
    if !HEAP.is_debug() {
        println!(fg = LightGrey, "mem: leak tracking needs the alloc_debug feature");
        return 0;
    }

    let mut count = 0;
    HEAP.for_each_leak(|leak| {
        count += 1;
        println!(
            "  0x{:x} ({} bytes) from {}:{}",
            leak.user_addr,
            leak.block_size,
            leak.location.file(),
            leak.location.line()
        );
    });
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Tests the zero size and null cases.
    #[test_case]
    fn zero_and_null() {
        assert!(kmalloc(0).is_none());
        unsafe { kfree(core::ptr::null_mut()) }
    }

    /// Tests that balanced kmalloc & kfree don't leak.
    #[test_case]
    fn balanced_allocations_dont_leak() {
        HEAP.shrink();
        let before = stats().buddy.free_bytes;

        let mut ptrs = [core::ptr::null_mut(); 6];
        for (i, size) in [1, 48, 300, 2048, 4000, 70_000].into_iter().enumerate() {
            let ptr = kmalloc(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 16, 0);
            unsafe { ptr.as_ptr().write_bytes(0xAB, size) };
            ptrs[i] = ptr.as_ptr();
        }
        for ptr in ptrs {
            unsafe { kfree(ptr) }
        }

        HEAP.shrink();
        assert_eq!(stats().buddy.free_bytes, before);
    }

    /// Tests that the global allocator works.
    #[test_case]
    fn alloc_collections() {
        let mut v: Vec<u32> = (0..1000).collect();
        v.retain(|n| n % 2 == 0);
        assert_eq!(v.len(), 500);
        assert_eq!(v.iter().sum::<u32>(), 249_500);
    }
}
