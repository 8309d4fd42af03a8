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
    libmem/src/buddy.rs

    Hands out blocks of `1 << order` bytes from a single contiguous region,
    splitting bigger blocks on allocation and merging buddies on free.
*/

use crate::{
    MAX_ORDER, MIN_BLOCK_SIZE, MIN_ORDER, PAGE_ORDER, PAGE_SIZE, align_up,
    debug::{self, Allocation, LeakTracker, TRACKER_SLOTS},
    size_to_order,
};
use core::{panic::Location, ptr::NonNull};
use thiserror::Error;

/// Number of free lists, one per order.
const ORDERS: usize = MAX_ORDER - MIN_ORDER + 1;

/// Size of the largest block, the heap's base is aligned to this.
const MAX_BLOCK_SIZE: usize = 1 << MAX_ORDER;

/// The link stored in the first word of every free block.
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

#[derive(Error, Debug, PartialEq)]
pub enum HeapInitError {
    #[error("Heap was already initialised")]
    AlreadyInit,
    #[error("Region of {0} bytes is too small to hold a heap")]
    TooSmall(usize),
}

/// Counters kept by the buddy allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BuddyStats {
    pub alloc_count: usize,
    pub free_count: usize,
    pub failed_alloc_count: usize,
    pub free_bytes: usize,
    pub total_bytes: usize,
}

pub struct BuddyAllocator {
    /// Virtual address of the first block, aligned to `MAX_BLOCK_SIZE`.
    base: usize,
    /// Bytes managed, not always a power of two.
    size: usize,
    free_lists: [Option<NonNull<FreeBlock>>; ORDERS],
    stats: BuddyStats,
    tracker: LeakTracker<TRACKER_SLOTS>,
}

// Safety: Free blocks are only reachable through the allocator, which sits behind a lock
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Creates an allocator managing nothing, every allocation fails until [`init`](Self::init) is called.
    pub const fn empty() -> Self {
        BuddyAllocator {
            base: 0,
            size: 0,
            free_lists: [None; ORDERS],
            stats: BuddyStats {
                alloc_count: 0,
                free_count: 0,
                failed_alloc_count: 0,
                free_bytes: 0,
                total_bytes: 0,
            },
            tracker: LeakTracker::new(),
        }
    }

    /// Takes ownership of the physical region `[phys_start, phys_start + size)`,
    /// which is mapped at `virt_offset + phys`.
    ///
    /// The start is aligned up to the largest block size, then the rest is chopped
    /// into the largest self-aligned blocks that fit. Returns the number of bytes managed.
    ///
    /// # Safety
    /// The region must be mapped, writable and not used by anything else for as long
    /// as the allocator lives.
    pub unsafe fn init(&mut self, phys_start: usize, size: usize, virt_offset: usize) -> Result<usize, HeapInitError> {
        if self.size != 0 {
            return Err(HeapInitError::AlreadyInit);
        }

        let aligned = align_up(phys_start, MAX_BLOCK_SIZE);
        let lost = aligned - phys_start;
        if size <= lost || size - lost < PAGE_SIZE {
            return Err(HeapInitError::TooSmall(size));
        }

        // keep whole minimum blocks only
        let usable = (size - lost) & !(MIN_BLOCK_SIZE - 1);
        self.base = virt_offset + aligned;
        self.size = usable;

        let mut offset = 0;
        while usable - offset >= MIN_BLOCK_SIZE {
            let remaining = usable - offset;
            let mut order = MAX_ORDER;
            while (1 << order) > remaining || offset & ((1 << order) - 1) != 0 {
                order -= 1;
            }

            // Safety: The block is inside the region the caller gave us
            unsafe { self.push(self.base + offset, order) };
            offset += 1 << order;
        }

        self.stats.free_bytes = usable;
        self.stats.total_bytes = usable;
        Ok(usable)
    }

    /// Allocates a block of `1 << order` bytes, aligned to its own size.
    ///
    /// Returns `None` and bumps the failure counter when nothing big enough is free.
    pub fn alloc(&mut self, order: usize) -> Option<NonNull<u8>> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            self.stats.failed_alloc_count += 1;
            return None;
        }

        let Some(found) = (order..=MAX_ORDER).find(|&o| self.list(o).is_some()) else {
            self.stats.failed_alloc_count += 1;
            return None;
        };

        // Safety: The list was just checked to be non-empty
        let block = unsafe { self.pop(found) }?;
        let addr = block.as_ptr() as usize;

        // split, handing the upper halves back
        for k in (order..found).rev() {
            // Safety: The upper half of a free block is free
            unsafe { self.push(addr + (1 << k), k) };
        }

        if order >= PAGE_ORDER {
            assert_eq!(addr % PAGE_SIZE, 0, "buddy returned a misaligned page {addr:#x}");
        }

        self.stats.alloc_count += 1;
        self.stats.free_bytes -= 1 << order;
        Some(block.cast())
    }

    /// Returns a block given out by [`alloc`](Self::alloc) with the same `order`.
    ///
    /// # Panics
    /// If `ptr` couldn't have come from this allocator at `order`, or is already free.
    ///
    /// # Safety
    /// `ptr` mustn't be used after this call.
    #[track_caller]
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, order: usize) {
        let mut addr = ptr.as_ptr() as usize;
        let mut order = order;
        self.check_block(addr, order);
        if let Some(k) = self.free_cover(addr, order) {
            panic!("double free of buddy block {addr:#x} (order {order}), already free in a block of order {k}");
        }
        self.stats.free_count += 1;
        self.stats.free_bytes += 1 << order;

        while order < MAX_ORDER {
            let buddy = self.base + ((addr - self.base) ^ (1 << order));
            if buddy + (1 << order) > self.base + self.size {
                break;
            }

            // Safety: Only touches blocks on the free lists
            match unsafe { self.unlink(buddy, addr, order) } {
                Unlinked::Buddy => {
                    addr = addr.min(buddy);
                    order += 1;
                }
                Unlinked::Missing => break,
                Unlinked::Itself => panic!("double free of buddy block {addr:#x} (order {order})"),
            }
        }

        // Safety: `check_block` ensured the block lies inside the heap
        unsafe { self.push(addr, order) }
    }

    /// Allocates at least `size` bytes.
    pub fn alloc_bytes(&mut self, size: usize) -> Option<NonNull<u8>> {
        match size_to_order(size) {
            Some(order) => self.alloc(order),
            None => {
                self.stats.failed_alloc_count += 1;
                None
            }
        }
    }

    /// Frees a block allocated by [`alloc_bytes`](Self::alloc_bytes) with the same `size`.
    ///
    /// # Safety
    /// Same as [`free`](Self::free).
    #[track_caller]
    pub unsafe fn free_bytes(&mut self, ptr: NonNull<u8>, size: usize) {
        let Some(order) = size_to_order(size) else {
            panic!("freed {ptr:p} with an impossible size of {size} bytes");
        };
        // Safety: Ensured by caller
        unsafe { self.free(ptr, order) }
    }

    /// Allocates `size` bytes surrounded by canaries, and remembers `location` as its owner.
    ///
    /// Returns the start of the user's data, which is 16 byte aligned.
    pub fn alloc_tracked(&mut self, size: usize, location: &'static Location<'static>) -> Option<NonNull<u8>> {
        let order = size_to_order(debug::padded_size(size))?;
        let block = self.alloc(order)?;

        // Safety: The block holds at least `padded_size(size)` bytes and is aligned to 32
        let user = unsafe { debug::arm(block.as_ptr(), size, order) };
        self.tracker.track(Allocation {
            user_addr: user as usize,
            block_addr: block.as_ptr() as usize,
            block_size: 1 << order,
            location,
        });

        NonNull::new(user)
    }

    /// Checks the canaries of an [`alloc_tracked`](Self::alloc_tracked) allocation then frees it.
    ///
    /// # Safety
    /// `user` must have come from `alloc_tracked` and not be used after this call.
    #[track_caller]
    pub unsafe fn free_tracked(&mut self, user: NonNull<u8>) {
        // Safety: Ensured by caller
        let (block, order) = unsafe { debug::disarm(user.as_ptr()) };
        self.tracker.untrack(user.as_ptr() as usize);

        if let Some(block) = NonNull::new(block) {
            // Safety: The block came from `alloc`
            unsafe { self.free(block, order) }
        }
    }

    /// Tracked allocations which were never freed.
    pub fn leaks(&self) -> impl Iterator<Item = &Allocation> {
        self.tracker.leaks()
    }

    /// Returns a copy of the allocator's counters.
    pub fn stats(&self) -> BuddyStats {
        self.stats
    }

    /// Whether `addr` lies inside the managed region.
    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.base + self.size).contains(&addr)
    }

    /// Counts the blocks on the free list of `order`.
    pub fn free_blocks(&self, order: usize) -> usize {
        let mut count = 0;
        let mut cur = self.list(order);
        while let Some(block) = cur {
            count += 1;
            // Safety: Every block on a free list holds a valid link
            cur = unsafe { block.as_ref().next };
        }
        count
    }

    #[track_caller]
    fn check_block(&self, addr: usize, order: usize) {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            panic!("freed {addr:#x} with invalid order {order}");
        }
        if !self.contains(addr) || addr + (1 << order) > self.base + self.size {
            panic!("freed {addr:#x} which isn't in the heap");
        }
        if (addr - self.base) & ((1 << order) - 1) != 0 {
            panic!("freed {addr:#x} which isn't aligned to order {order}");
        }
    }

    /// Returns the order of a free block holding `addr`, checking `order` and every bigger one.
    fn free_cover(&self, addr: usize, order: usize) -> Option<usize> {
        (order..=MAX_ORDER).find(|&k| {
            let start = self.base + ((addr - self.base) & !((1 << k) - 1));
            let mut cur = self.list(k);
            while let Some(block) = cur {
                if block.as_ptr() as usize == start {
                    return true;
                }
                // Safety: Every block on a free list holds a valid link
                cur = unsafe { block.as_ref().next };
            }
            false
        })
    }

    fn list(&self, order: usize) -> Option<NonNull<FreeBlock>> {
        self.free_lists[order - MIN_ORDER]
    }

    /// # Safety
    /// `addr` must be the start of a free block of `order` inside the heap.
    unsafe fn push(&mut self, addr: usize, order: usize) {
        let head = &mut self.free_lists[order - MIN_ORDER];
        let block = addr as *mut FreeBlock;
        // Safety: Ensured by caller
        unsafe { block.write(FreeBlock { next: *head }) };
        *head = NonNull::new(block);
    }

    /// # Safety
    /// Every block on the list must hold a valid link.
    unsafe fn pop(&mut self, order: usize) -> Option<NonNull<FreeBlock>> {
        let head = &mut self.free_lists[order - MIN_ORDER];
        let block = (*head)?;
        // Safety: Ensured by caller
        *head = unsafe { block.as_ref().next };
        Some(block)
    }

    /// Walks the free list of `order` removing `buddy` if it's there.
    /// Also notices if `addr` itself is on the list.
    ///
    /// # Safety
    /// Every block on the list must hold a valid link.
    unsafe fn unlink(&mut self, buddy: usize, addr: usize, order: usize) -> Unlinked {
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cur = self.list(order);

        while let Some(mut block) = cur {
            let this = block.as_ptr() as usize;
            // Safety: Ensured by caller
            let next = unsafe { block.as_mut().next };

            if this == addr {
                return Unlinked::Itself;
            }

            if this == buddy {
                match prev {
                    // Safety: Ensured by caller
                    Some(mut p) => unsafe { p.as_mut().next = next },
                    None => self.free_lists[order - MIN_ORDER] = next,
                }
                return Unlinked::Buddy;
            }

            prev = Some(block);
            cur = next;
        }

        Unlinked::Missing
    }
}

/// The result of searching a free list for a buddy.
enum Unlinked {
    Buddy,
    Missing,
    Itself,
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Region;

    fn heap(region: &Region) -> BuddyAllocator {
        let mut buddy = BuddyAllocator::empty();
        unsafe { buddy.init(region.start(), region.size(), 0) }.unwrap();
        buddy
    }

    /// Tests that a fresh heap is made of max order blocks.
    #[test]
    fn init_chops_region() {
        let region = Region::new(4 * MAX_BLOCK_SIZE);
        let buddy = heap(&region);
        assert_eq!(buddy.free_blocks(MAX_ORDER), 4);
        assert_eq!(buddy.stats().free_bytes, 4 * MAX_BLOCK_SIZE);
    }

    /// Tests that an unaligned start loses the bytes before the first aligned address
    /// and a ragged end becomes smaller blocks.
    #[test]
    fn init_aligns_start() {
        let region = Region::new(2 * MAX_BLOCK_SIZE);
        let mut buddy = BuddyAllocator::empty();
        let size = unsafe { buddy.init(region.start() + PAGE_SIZE, 2 * MAX_BLOCK_SIZE - 2 * PAGE_SIZE, 0) }.unwrap();
        assert_eq!(size, MAX_BLOCK_SIZE - PAGE_SIZE);
        assert_eq!(buddy.free_blocks(MAX_ORDER), 0);
        assert_eq!(buddy.free_blocks(MAX_ORDER - 1), 1);
        assert_eq!(buddy.free_blocks(PAGE_ORDER), 1);
        assert_eq!(unsafe { buddy.init(region.start(), region.size(), 0) }, Err(HeapInitError::AlreadyInit))
    }

    /// Tests that every order survives balanced alloc / free pairs unchanged.
    #[test]
    fn alloc_free_is_symmetric() {
        let region = Region::new(2 * MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let before = buddy.stats().free_bytes;

        for order in MIN_ORDER..=MAX_ORDER {
            let blocks: Vec<_> = (0..3).filter_map(|_| buddy.alloc(order)).collect();
            assert!(!blocks.is_empty());
            for block in blocks.into_iter().rev() {
                unsafe { buddy.free(block, order) };
            }
            assert_eq!(buddy.stats().free_bytes, before, "order {order} leaked");
        }

        assert_eq!(buddy.free_blocks(MAX_ORDER), 2)
    }

    /// Tests that page sized and larger blocks are always page aligned,
    /// and smaller blocks are aligned to their size.
    #[test]
    fn blocks_are_aligned() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let _small = buddy.alloc(MIN_ORDER).unwrap();

        for order in [6, PAGE_ORDER, PAGE_ORDER + 1, 16] {
            let block = buddy.alloc(order).unwrap().as_ptr() as usize;
            assert_eq!(block % (1 << order), 0);
            if order >= PAGE_ORDER {
                assert_eq!(block % PAGE_SIZE, 0)
            }
        }
    }

    /// Tests that splitting then freeing both halves merges them back.
    #[test]
    fn buddies_merge() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let a = buddy.alloc(MAX_ORDER - 1).unwrap();
        let b = buddy.alloc(MAX_ORDER - 1).unwrap();
        assert_eq!(a.as_ptr() as usize ^ b.as_ptr() as usize, 1 << (MAX_ORDER - 1));
        assert!(buddy.alloc(MIN_ORDER).is_none());

        unsafe {
            buddy.free(b, MAX_ORDER - 1);
            buddy.free(a, MAX_ORDER - 1);
        }
        assert_eq!(buddy.free_blocks(MAX_ORDER), 1);
        assert_eq!(buddy.free_blocks(MAX_ORDER - 1), 0)
    }

    /// Tests draining the heap, failing once, then recovering after one free.
    #[test]
    fn out_of_memory_recovers() {
        let region = Region::new(3 * MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let blocks: Vec<_> = core::iter::from_fn(|| buddy.alloc(MAX_ORDER)).collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(buddy.stats().failed_alloc_count, 1);

        assert!(buddy.alloc(MAX_ORDER).is_none());
        assert_eq!(buddy.stats().failed_alloc_count, 2);

        unsafe { buddy.free(blocks[1], MAX_ORDER) };
        assert!(buddy.alloc(MAX_ORDER).is_some());
        assert_eq!(buddy.stats().failed_alloc_count, 2)
    }

    /// Tests that freeing the same block twice panics.
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let a = buddy.alloc(PAGE_ORDER).unwrap();
        let _b = buddy.alloc(PAGE_ORDER).unwrap();
        unsafe {
            buddy.free(a, PAGE_ORDER);
            buddy.free(a, PAGE_ORDER);
        }
    }

    /// Tests that freeing a block again after it merged with its buddy is caught.
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_after_merge_panics() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let a = buddy.alloc(PAGE_ORDER).unwrap();
        unsafe {
            // merges all the way back up into the single max order block
            buddy.free(a, PAGE_ORDER);
            buddy.free(a, PAGE_ORDER);
        }
    }

    /// Tests that a max order block can't be freed twice.
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_of_max_order_panics() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let a = buddy.alloc(MAX_ORDER).unwrap();
        unsafe {
            buddy.free(a, MAX_ORDER);
            buddy.free(a, MAX_ORDER);
        }
    }

    /// Tests that addresses outside of the heap are rejected.
    #[test]
    #[should_panic(expected = "isn't in the heap")]
    fn foreign_free_panics() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let mut local = 0u64;
        unsafe { buddy.free(NonNull::from(&mut local).cast(), MIN_ORDER) }
    }

    /// Tests that tracked allocations show up as leaks until freed.
    #[test]
    fn tracked_allocations() {
        let region = Region::new(MAX_BLOCK_SIZE);
        let mut buddy = heap(&region);
        let before = buddy.stats().free_bytes;

        let user = buddy.alloc_tracked(100, Location::caller()).unwrap();
        assert_eq!(user.as_ptr() as usize % 16, 0);
        assert_eq!(buddy.leaks().count(), 1);
        assert_eq!(buddy.leaks().next().unwrap().block_size, 128);

        unsafe {
            user.as_ptr().write_bytes(0x55, 100);
            buddy.free_tracked(user);
        }
        assert_eq!(buddy.leaks().count(), 0);
        assert_eq!(buddy.stats().free_bytes, before)
    }
}
