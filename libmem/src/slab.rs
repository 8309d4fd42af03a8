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
    libmem/src/slab.rs

    Caches of equally sized objects, each slab being a single buddy page
    with its header at the page's base.
*/

use crate::{BuddyAllocator, PAGE_ORDER, PAGE_SIZE, align_up};
use core::ptr::{self, NonNull};
use libutil::Spinlock;

/// Marks a page as a slab.
pub const SLAB_MAGIC: u32 = 0x51AB_CAC3;

/// Written at the end of every slot which is allocated or was never handed out.
pub const FOOTER_CANARY: u32 = 0x5AFE_F00D;

/// Written at the end of every slot once freed.
const FREED_MARK: u32 = 0xF4EE_D5AB;

const FOOTER_SIZE: usize = size_of::<u32>();

/// Sits at the base of every slab page.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    cache_id: u16,
    free_count: u16,
    objs: u16,
    color_offset: u16,
    free_list: Option<NonNull<FreeSlot>>,
    prev: Option<NonNull<SlabHeader>>,
    next: Option<NonNull<SlabHeader>>,
}

/// The link in the first word of every free slot.
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Intrusive doubly linked list of slabs.
#[derive(Debug, Default)]
struct SlabList {
    head: Option<NonNull<SlabHeader>>,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        SlabList { head: None, len: 0 }
    }

    /// # Safety
    /// `slab` must be a valid header which isn't on any list.
    unsafe fn push(&mut self, mut slab: NonNull<SlabHeader>) {
        // Safety: Ensured by caller
        unsafe {
            let hdr = slab.as_mut();
            hdr.prev = None;
            hdr.next = self.head;
            if let Some(mut head) = self.head {
                head.as_mut().prev = Some(slab);
            }
        }
        self.head = Some(slab);
        self.len += 1;
    }

    /// # Safety
    /// `slab` must be a valid header on this list.
    unsafe fn remove(&mut self, mut slab: NonNull<SlabHeader>) {
        // Safety: Ensured by caller
        unsafe {
            let hdr = slab.as_mut();
            match hdr.prev {
                Some(mut prev) => prev.as_mut().next = hdr.next,
                None => self.head = hdr.next,
            }
            if let Some(mut next) = hdr.next {
                next.as_mut().prev = hdr.prev;
            }
            hdr.prev = None;
            hdr.next = None;
        }
        self.len -= 1;
    }
}

/// Which list a slab belongs on.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SlabState {
    Empty,
    Partial,
    Full,
}

/// Counters kept by each cache.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SlabStats {
    pub allocs: usize,
    pub frees: usize,
    pub slabs: usize,
    pub reclaimed: usize,
    pub live: usize,
}

impl SlabStats {
    /// Adds the counters of `other` onto `self`.
    pub fn merge(&mut self, other: SlabStats) {
        self.allocs += other.allocs;
        self.frees += other.frees;
        self.slabs += other.slabs;
        self.reclaimed += other.reclaimed;
        self.live += other.live;
    }
}

/// A cache of `object_size` byte objects.
pub struct SlabCache {
    name: &'static str,
    id: u16,
    object_size: usize,
    slot_size: usize,
    align: usize,
    /// Bytes from the page base to the first slot of an uncolored slab.
    data_offset: usize,
    objs_per_slab: usize,
    color_range: usize,
    color_next: usize,
    partial: SlabList,
    full: SlabList,
    empty: SlabList,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
    reclaim: bool,
    stats: SlabStats,
}

// Safety: Slabs are only reachable through their cache, which sits behind a lock
unsafe impl Send for SlabCache {}

impl SlabCache {
    /// Creates a cache of `object_size` byte objects aligned to `align`.
    ///
    /// # Panics
    /// If `align` isn't a power of two, or a slot doesn't fit in a page.
    pub const fn new(name: &'static str, id: u16, object_size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two() && align <= PAGE_SIZE / 2);

        let min_slot = if object_size < size_of::<FreeSlot>() {
            size_of::<FreeSlot>()
        } else {
            object_size
        };
        let slot_size = align_up(min_slot + FOOTER_SIZE, align);
        let data_offset = align_up(size_of::<SlabHeader>(), align);
        assert!(data_offset + slot_size <= PAGE_SIZE, "slab object too big for a page");

        let objs_per_slab = (PAGE_SIZE - data_offset) / slot_size;
        let spare = PAGE_SIZE - data_offset - objs_per_slab * slot_size;

        SlabCache {
            name,
            id,
            object_size,
            slot_size,
            align,
            data_offset,
            objs_per_slab,
            color_range: spare / align * align,
            color_next: 0,
            partial: SlabList::new(),
            full: SlabList::new(),
            empty: SlabList::new(),
            ctor: None,
            dtor: None,
            reclaim: true,
            stats: SlabStats {
                allocs: 0,
                frees: 0,
                slabs: 0,
                reclaimed: 0,
                live: 0,
            },
        }
    }

    /// Sets functions run on each object after it's allocated and before it's freed.
    pub const fn with_ctor(mut self, ctor: Option<fn(*mut u8)>, dtor: Option<fn(*mut u8)>) -> Self {
        self.ctor = ctor;
        self.dtor = dtor;
        self
    }

    /// Whether slabs which become empty are handed straight back to the buddy allocator.
    pub const fn with_reclaim(mut self, reclaim: bool) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Allocates one object, growing the cache if needed.
    pub fn alloc(&mut self, buddy: &Spinlock<BuddyAllocator>) -> Option<NonNull<u8>> {
        let slab = match self.partial.head.or(self.empty.head) {
            Some(slab) => slab,
            None => self.grow(buddy)?,
        };

        // Safety: Every slab on our lists has a valid header and free list
        unsafe {
            self.unlink(slab);
            let hdr = &mut *slab.as_ptr();
            let Some(slot) = hdr.free_list else {
                panic!("slab corruption: {} slab {slab:p} has no free slots", self.name);
            };
            hdr.free_list = slot.as_ref().next;
            hdr.free_count -= 1;
            self.relink(slab);

            let obj = slot.cast::<u8>();
            let footer = self.footer(obj);
            match footer.read() {
                FOOTER_CANARY | FREED_MARK => footer.write(FOOTER_CANARY),
                other => panic!("slab corruption: free {} object {obj:p} has footer {other:#x}", self.name),
            }

            if let Some(ctor) = self.ctor {
                ctor(obj.as_ptr());
            }

            self.stats.allocs += 1;
            self.stats.live += 1;
            Some(obj)
        }
    }

    /// Returns `obj` to its slab.
    ///
    /// # Panics
    /// If `obj` wasn't allocated from this cache, was already freed, or it's footer was overwritten.
    ///
    /// # Safety
    /// `obj` must point into a page mapped by the heap, and mustn't be used after this call.
    #[track_caller]
    pub unsafe fn free(&mut self, obj: NonNull<u8>, buddy: &Spinlock<BuddyAllocator>) {
        let addr = obj.as_ptr() as usize;
        let page = addr & !(PAGE_SIZE - 1);
        let slab = page as *mut SlabHeader;

        // Safety: Ensured by caller, checked with the magic before being trusted
        let hdr = unsafe { &mut *slab };
        if hdr.magic != SLAB_MAGIC {
            panic!("freed {obj:p} which isn't in a slab");
        }
        if hdr.cache_id != self.id {
            panic!("freed {obj:p} into {} but it belongs to cache {}", self.name, hdr.cache_id);
        }

        let start = page + self.data_offset + hdr.color_offset as usize;
        let index = addr.wrapping_sub(start) / self.slot_size;
        if addr < start || (addr - start) % self.slot_size != 0 || index >= hdr.objs as usize {
            panic!("freed {obj:p} which isn't the start of a {} object", self.name);
        }

        // Safety: The slot was just checked to be inside the slab
        unsafe {
            let footer = self.footer(obj);
            match footer.read() {
                FOOTER_CANARY => (),
                FREED_MARK => panic!("double free of {} object {obj:p}", self.name),
                other => panic!("heap overflow: {} object {obj:p} has footer {other:#x}", self.name),
            }

            if let Some(dtor) = self.dtor {
                dtor(obj.as_ptr());
            }

            let slab = NonNull::new_unchecked(slab);
            self.unlink(slab);
            let slot = obj.cast::<FreeSlot>();
            slot.write(FreeSlot { next: hdr.free_list });
            footer.write(FREED_MARK);
            hdr.free_list = Some(slot);
            hdr.free_count += 1;

            self.stats.frees += 1;
            self.stats.live -= 1;

            if self.reclaim && hdr.free_count == hdr.objs {
                self.release(slab, buddy);
            } else {
                self.relink(slab);
            }
        }
    }

    /// Hands every empty slab back to the buddy allocator, returning how many there were.
    pub fn shrink(&mut self, buddy: &Spinlock<BuddyAllocator>) -> usize {
        let mut count = 0;
        while let Some(slab) = self.empty.head {
            // Safety: Slabs on the empty list hold no live objects
            unsafe {
                self.empty.remove(slab);
                self.release(slab, buddy);
            }
            count += 1;
        }
        count
    }

    /// Frees every slab no matter what's in them, returning the number of objects which were still live.
    pub fn destroy(&mut self, buddy: &Spinlock<BuddyAllocator>) -> usize {
        let live = self.stats.live;
        for state in [SlabState::Full, SlabState::Partial] {
            while let Some(slab) = self.list(state).head {
                // Safety: Every slab on our lists has a valid header
                unsafe {
                    self.list(state).remove(slab);
                    self.release(slab, buddy);
                }
            }
        }
        self.shrink(buddy);
        self.stats.live = 0;
        live
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Bytes a caller may use in each object.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Bytes each object takes up in a slab, including the footer.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn objs_per_slab(&self) -> usize {
        self.objs_per_slab
    }

    pub fn stats(&self) -> SlabStats {
        self.stats
    }

    /// Number of slabs on the (empty, partial, full) lists.
    pub fn slab_counts(&self) -> (usize, usize, usize) {
        (self.empty.len, self.partial.len, self.full.len)
    }

    /// Takes a page from buddy and fills it with free slots.
    fn grow(&mut self, buddy: &Spinlock<BuddyAllocator>) -> Option<NonNull<SlabHeader>> {
        let page = buddy.lock_irqsave().alloc(PAGE_ORDER)?;

        let color_offset = match self.color_range {
            0 => 0,
            range => (self.color_next * self.align) % range,
        };
        self.color_next = self.color_next.wrapping_add(1);

        let objs = (PAGE_SIZE - self.data_offset - color_offset) / self.slot_size;
        let start = page.as_ptr() as usize + self.data_offset + color_offset;

        // Safety: The page is ours and every slot lies within it
        unsafe {
            let mut free_list = None;
            for i in (0..objs).rev() {
                let slot = NonNull::new_unchecked((start + i * self.slot_size) as *mut FreeSlot);
                slot.write(FreeSlot { next: free_list });
                self.footer(slot.cast()).write(FOOTER_CANARY);
                free_list = Some(slot);
            }

            let slab = page.cast::<SlabHeader>();
            slab.write(SlabHeader {
                magic: SLAB_MAGIC,
                cache_id: self.id,
                free_count: objs as u16,
                objs: objs as u16,
                color_offset: color_offset as u16,
                free_list,
                prev: None,
                next: None,
            });

            self.empty.push(slab);
            self.stats.slabs += 1;
            Some(slab)
        }
    }

    /// # Safety
    /// `slab` must not be on a list and hold no live objects.
    unsafe fn release(&mut self, slab: NonNull<SlabHeader>, buddy: &Spinlock<BuddyAllocator>) {
        // Safety: Ensured by caller
        unsafe {
            (*slab.as_ptr()).magic = 0;
            buddy.lock_irqsave().free(slab.cast(), PAGE_ORDER);
        }
        self.stats.slabs -= 1;
        self.stats.reclaimed += 1;
    }

    /// # Safety
    /// `slab` must be a valid header.
    unsafe fn state(&self, slab: NonNull<SlabHeader>) -> SlabState {
        // Safety: Ensured by caller
        let hdr = unsafe { slab.as_ref() };
        match hdr.free_count {
            0 => SlabState::Full,
            n if n == hdr.objs => SlabState::Empty,
            _ => SlabState::Partial,
        }
    }

    fn list(&mut self, state: SlabState) -> &mut SlabList {
        match state {
            SlabState::Empty => &mut self.empty,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }

    /// Removes `slab` from whichever list its counts place it on.
    ///
    /// # Safety
    /// `slab` must be a valid header on the list matching its state.
    unsafe fn unlink(&mut self, slab: NonNull<SlabHeader>) {
        // Safety: Ensured by caller
        unsafe {
            let state = self.state(slab);
            self.list(state).remove(slab)
        }
    }

    /// Puts `slab` onto the list matching its counts.
    ///
    /// # Safety
    /// `slab` must be a valid header which isn't on any list.
    unsafe fn relink(&mut self, slab: NonNull<SlabHeader>) {
        // Safety: Ensured by caller
        unsafe {
            let state = self.state(slab);
            self.list(state).push(slab)
        }
    }

    fn footer(&self, obj: NonNull<u8>) -> *mut u32 {
        obj.as_ptr().wrapping_add(self.slot_size - FOOTER_SIZE).cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MAX_ORDER, testutil::Region};
    use std::collections::HashSet;

    fn buddy(region: &Region) -> Spinlock<BuddyAllocator> {
        let mut buddy = BuddyAllocator::empty();
        unsafe { buddy.init(region.start(), region.size(), 0) }.unwrap();
        Spinlock::new(buddy)
    }

    /// Tests the slot and per slab counts of a 64 byte cache.
    #[test]
    fn geometry() {
        let cache = SlabCache::new("test-64", 1, 64, 16);
        assert_eq!(size_of::<SlabHeader>(), 40);
        assert_eq!(cache.slot_size(), 80);
        assert_eq!(cache.objs_per_slab(), (PAGE_SIZE - 48) / 80);
        assert_eq!(cache.color_range, 48);

        let tiny = SlabCache::new("test-1", 2, 1, 8);
        assert_eq!(tiny.slot_size(), 16);

        let huge = SlabCache::new("test-2048", 3, 2048, 16);
        assert_eq!(huge.objs_per_slab(), 1)
    }

    /// Tests that no live address is ever handed out twice, and freed objects get reused.
    #[test]
    fn objects_are_unique() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-48", 1, 48, 16);

        let objs: Vec<_> = (0..300).map(|_| cache.alloc(&buddy).unwrap()).collect();
        let unique: HashSet<_> = objs.iter().map(|o| o.as_ptr() as usize).collect();
        assert_eq!(unique.len(), objs.len());

        for (i, obj) in objs.iter().enumerate() {
            unsafe { obj.as_ptr().write_bytes(i as u8, 48) };
        }
        for (i, obj) in objs.iter().enumerate() {
            let data = unsafe { core::slice::from_raw_parts(obj.as_ptr(), 48) };
            assert!(data.iter().all(|&b| b == i as u8), "object {i} was clobbered");
        }

        let victim = objs[7];
        unsafe { cache.free(victim, &buddy) };
        let again = cache.alloc(&buddy).unwrap();
        assert_eq!(again, victim);
        assert!(!objs[8..].contains(&again))
    }

    /// Tests that slabs move between the empty, partial and full lists.
    #[test]
    fn slabs_change_lists() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-256", 1, 256, 16).with_reclaim(false);
        let per_slab = cache.objs_per_slab();

        let objs: Vec<_> = (0..per_slab).map(|_| cache.alloc(&buddy).unwrap()).collect();
        assert_eq!(cache.slab_counts(), (0, 0, 1));

        unsafe { cache.free(objs[0], &buddy) };
        assert_eq!(cache.slab_counts(), (0, 1, 0));

        for obj in &objs[1..] {
            unsafe { cache.free(*obj, &buddy) };
        }
        assert_eq!(cache.slab_counts(), (1, 0, 0));
        assert_eq!(cache.stats().live, 0);

        assert_eq!(cache.shrink(&buddy), 1);
        assert_eq!(cache.slab_counts(), (0, 0, 0))
    }

    /// Tests that empty slabs are given back to buddy when reclaiming.
    #[test]
    fn reclaim_returns_pages() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let before = buddy.lock().stats().free_bytes;
        let mut cache = SlabCache::new("test-512", 1, 512, 16);

        let objs: Vec<_> = (0..20).map(|_| cache.alloc(&buddy).unwrap()).collect();
        assert!(buddy.lock().stats().free_bytes < before);
        for obj in objs {
            unsafe { cache.free(obj, &buddy) };
        }

        assert_eq!(cache.stats().slabs, 0);
        assert_eq!(buddy.lock().stats().free_bytes, before)
    }

    /// Tests that consecutive slabs start their objects at different offsets.
    #[test]
    fn slabs_are_colored() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-64", 1, 64, 16);
        let per_slab = cache.objs_per_slab();

        let offsets: Vec<_> = (0..3)
            .map(|_| {
                let first = cache.alloc(&buddy).unwrap().as_ptr() as usize % PAGE_SIZE;
                for _ in 1..per_slab {
                    cache.alloc(&buddy).unwrap();
                }
                first
            })
            .collect();

        assert_eq!(offsets, [48, 64, 80])
    }

    /// Tests that constructors run on every allocation.
    #[test]
    fn ctor_runs() {
        fn ctor(obj: *mut u8) {
            unsafe { obj.write_bytes(0x77, 32) }
        }

        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-32", 1, 32, 16).with_ctor(Some(ctor), None);
        let obj = cache.alloc(&buddy).unwrap();
        assert_eq!(unsafe { obj.as_ptr().read() }, 0x77);
        assert_eq!(unsafe { obj.as_ptr().add(31).read() }, 0x77);
    }

    /// Tests that freeing an object twice panics.
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-32", 1, 32, 16).with_reclaim(false);
        let obj = cache.alloc(&buddy).unwrap();
        let _keep = cache.alloc(&buddy).unwrap();
        unsafe {
            cache.free(obj, &buddy);
            cache.free(obj, &buddy);
        }
    }

    /// Tests that writing past the end of an object is caught on free.
    #[test]
    #[should_panic(expected = "heap overflow")]
    fn overflow_panics() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-32", 1, 32, 16);
        let obj = cache.alloc(&buddy).unwrap();
        unsafe {
            obj.as_ptr().write_bytes(0xFF, cache.slot_size());
            cache.free(obj, &buddy);
        }
    }

    /// Tests that pointers from the middle of an object are rejected.
    #[test]
    #[should_panic(expected = "isn't the start")]
    fn interior_pointer_panics() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut cache = SlabCache::new("test-64", 1, 64, 16);
        let obj = cache.alloc(&buddy).unwrap();
        unsafe { cache.free(obj.add(8), &buddy) }
    }

    /// Tests that an object can't be freed into the wrong cache.
    #[test]
    #[should_panic(expected = "belongs to cache 1")]
    fn wrong_cache_panics() {
        let region = Region::new(1 << MAX_ORDER);
        let buddy = buddy(&region);
        let mut a = SlabCache::new("a", 1, 64, 16);
        let mut b = SlabCache::new("b", 2, 64, 16);
        let obj = a.alloc(&buddy).unwrap();
        unsafe { b.free(obj, &buddy) }
    }
}
