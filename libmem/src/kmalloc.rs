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
    libmem/src/kmalloc.rs

    The heap's front end. Small requests are served from the current CPU's
    slab caches, everything else gets a buddy block. Every allocation starts
    with a header saying where it came from.
*/

use crate::{
    BuddyAllocator, BuddyStats, HeapInitError, SlabStats, align_up, debug,
    debug::Allocation,
    percpu::{CpuAllocator, MAX_CPUS, SIZE_CLASSES, class_for, current_cpu, decode_id},
    size_to_order,
};
use core::{
    alloc::{GlobalAlloc, Layout},
    panic::Location,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};
use libutil::Spinlock;

/// Alignment of every pointer kmalloc returns.
pub const KMALLOC_MIN_ALIGN: usize = 16;

/// Largest request served by a slab cache.
pub const SLAB_MAX: usize = 2048;

/// Size of the header in front of every allocation.
pub const HEADER_SIZE: usize = size_of::<KmallocHeader>();

/// Marks a live allocation.
const KMALLOC_MAGIC: u32 = 0x4B4D_A110;

/// Replaces the magic once an allocation is freed.
const KMALLOC_FREED: u32 = 0x4B4D_DEAD;

const KIND_SLAB: u8 = 1;
const KIND_BUDDY: u8 = 2;
/// A buddy block wrapped in canaries and recorded by the leak tracker.
const KIND_TRACKED: u8 = 3;

#[repr(C)]
struct KmallocHeader {
    /// Object size for slabs, block size for buddy blocks.
    allocated_size: usize,
    kind: u8,
    _reserved: u8,
    /// Slab cache the allocation came from, 0 if it's a buddy block.
    cache_id: u16,
    magic: u32,
}

const _: () = assert!(HEADER_SIZE == KMALLOC_MIN_ALIGN);

/// Everything the heap counts.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HeapStats {
    pub buddy: BuddyStats,
    pub slab: SlabStats,
    pub slab_allocs: usize,
    pub buddy_allocs: usize,
    pub frees: usize,
}

/// The kernel heap.
pub struct Heap {
    buddy: Spinlock<BuddyAllocator>,
    cpus: [CpuAllocator; MAX_CPUS],
    /// Whether buddy allocations get canaries and leak tracking.
    debug: bool,
    slab_allocs: AtomicUsize,
    buddy_allocs: AtomicUsize,
    frees: AtomicUsize,
}

const _: () = assert!(MAX_CPUS == 4);

impl Heap {
    /// Creates an empty heap, which can't allocate until [`init`](Self::init) is called.
    pub const fn new() -> Self {
        Heap {
            buddy: Spinlock::new(BuddyAllocator::empty()),
            cpus: [CpuAllocator::new(0), CpuAllocator::new(1), CpuAllocator::new(2), CpuAllocator::new(3)],
            debug: cfg!(feature = "alloc_debug"),
            slab_allocs: AtomicUsize::new(0),
            buddy_allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    /// Overrides whether buddy allocations are tracked.
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Hands the physical region at `phys_start`, mapped at `virt_offset + phys`, to the buddy allocator.
    ///
    /// # Safety
    /// See [`BuddyAllocator::init`].
    pub unsafe fn init(&self, phys_start: usize, size: usize, virt_offset: usize) -> Result<usize, HeapInitError> {
        // Safety: Ensured by caller
        unsafe { self.buddy.lock_irqsave().init(phys_start, size, virt_offset) }
    }

    /// Allocates `size` bytes aligned to [`KMALLOC_MIN_ALIGN`].
    ///
    /// Returns `None` for zero sized requests or when the heap is exhausted.
    #[track_caller]
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let total = align_up(size.checked_add(HEADER_SIZE)?, KMALLOC_MIN_ALIGN);

        if size <= SLAB_MAX
            && let Some(class) = class_for(total)
            && let Some((obj, id)) = self.cpus[current_cpu()].alloc(class, &self.buddy)
        {
            self.slab_allocs.fetch_add(1, Ordering::Relaxed);
            // Safety: The object holds at least `total` bytes
            return Some(unsafe { stamp(obj, KIND_SLAB, SIZE_CLASSES[class], id) });
        }

        self.alloc_buddy(total)
    }

    /// Frees an allocation made by [`kmalloc`](Self::kmalloc). Null pointers are ignored.
    ///
    /// # Panics
    /// If the header in front of `ptr` is invalid, or it was already freed.
    ///
    /// # Safety
    /// `ptr` must be null or have come from this heap's `kmalloc`, and mustn't be used after.
    #[track_caller]
    pub unsafe fn kfree(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // Safety: Ensured by caller, everything kmalloc returns has a header in front of it
        unsafe {
            let hdr = ptr.sub(HEADER_SIZE).cast::<KmallocHeader>();
            match (*hdr).magic {
                KMALLOC_MAGIC => (),
                KMALLOC_FREED => panic!("double free of {ptr:p}"),
                magic => panic!("kfree({ptr:p}) found bad header magic {magic:#x}"),
            }
            (*hdr).magic = KMALLOC_FREED;

            let block = NonNull::new_unchecked(hdr.cast::<u8>());
            match (*hdr).kind {
                KIND_SLAB => {
                    let Some((cpu, class)) = decode_id((*hdr).cache_id) else {
                        panic!("kfree({ptr:p}) found unknown cache {}", (*hdr).cache_id);
                    };
                    self.cpus[cpu].free(class, block, &self.buddy)
                }
                KIND_BUDDY => self.buddy.lock_irqsave().free_bytes(block, (*hdr).allocated_size),
                KIND_TRACKED => self.buddy.lock_irqsave().free_tracked(block),
                kind => panic!("kfree({ptr:p}) found unknown allocation kind {kind}"),
            }
        }

        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns every empty slab to the buddy allocator.
    pub fn shrink(&self) -> usize {
        self.cpus.iter().map(|cpu| cpu.shrink(&self.buddy)).sum()
    }

    pub fn stats(&self) -> HeapStats {
        let mut slab = SlabStats::default();
        self.cpus.iter().for_each(|cpu| slab.merge(cpu.stats()));

        HeapStats {
            buddy: self.buddy.lock_irqsave().stats(),
            slab,
            slab_allocs: self.slab_allocs.load(Ordering::Relaxed),
            buddy_allocs: self.buddy_allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }

    /// Calls `f` with every tracked allocation which hasn't been freed.
    pub fn for_each_leak(&self, mut f: impl FnMut(&Allocation)) {
        self.buddy.lock_irqsave().leaks().for_each(&mut f);
    }

    /// The boot CPU's allocator.
    pub fn cpu_allocator(&self) -> &CpuAllocator {
        &self.cpus[current_cpu()]
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    #[track_caller]
    fn alloc_buddy(&self, total: usize) -> Option<NonNull<u8>> {
        let mut buddy = self.buddy.lock_irqsave();

        let (hdr, kind, allocated) = if self.debug {
            let order = size_to_order(debug::padded_size(total))?;
            (buddy.alloc_tracked(total, Location::caller())?, KIND_TRACKED, 1 << order)
        } else {
            let Some(order) = size_to_order(total) else {
                // alloc_bytes counts the failure
                return buddy.alloc_bytes(total);
            };
            (buddy.alloc(order)?, KIND_BUDDY, 1 << order)
        };

        drop(buddy);
        self.buddy_allocs.fetch_add(1, Ordering::Relaxed);
        // Safety: The block holds at least `total` bytes
        Some(unsafe { stamp(hdr, kind, allocated, 0) })
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a header at `block` and returns the user's pointer just after it.
///
/// # Safety
/// `block` must be valid for writes of `HEADER_SIZE` bytes and aligned to 16.
unsafe fn stamp(block: NonNull<u8>, kind: u8, allocated_size: usize, cache_id: u16) -> NonNull<u8> {
    // Safety: Ensured by caller
    unsafe {
        block.cast::<KmallocHeader>().write(KmallocHeader {
            allocated_size,
            kind,
            _reserved: 0,
            cache_id,
            magic: KMALLOC_MAGIC,
        });
        block.add(HEADER_SIZE)
    }
}

/// Allocations with small alignments go through kmalloc, bigger ones are given a whole
/// buddy block, which is always aligned to its own size.
unsafe impl GlobalAlloc for Heap {
    #[track_caller]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = if layout.align() <= KMALLOC_MIN_ALIGN {
            self.kmalloc(layout.size())
        } else {
            self.buddy.lock_irqsave().alloc_bytes(layout.size().max(layout.align()))
        };

        ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[track_caller]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= KMALLOC_MIN_ALIGN {
            // Safety: Came from kmalloc
            unsafe { self.kfree(ptr) }
        } else if let Some(block) = NonNull::new(ptr) {
            // Safety: Came from alloc_bytes with the same size
            unsafe { self.buddy.lock_irqsave().free_bytes(block, layout.size().max(layout.align())) }
        }
    }
}
