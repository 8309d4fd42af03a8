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
    libmem/src/percpu.rs

    Each CPU gets its own cache for every kmalloc size class. Only the boot
    CPU is ever brought up, but cache ids already encode which CPU they
    belong to so frees can find their way home.
*/

use crate::{BuddyAllocator, SlabCache, SlabStats};
use core::ptr::NonNull;
use libutil::Spinlock;

/// CPUs which have room for an allocator.
pub const MAX_CPUS: usize = 4;

/// Object sizes of the kmalloc caches, smallest first.
pub const SIZE_CLASSES: [usize; CLASSES] = [32, 64, 128, 256, 512, 1024, 2048];

/// Number of size classes.
pub const CLASSES: usize = 7;

/// Alignment of every kmalloc cache's objects.
const CLASS_ALIGN: usize = 16;

/// Cache ids start here, so a zeroed header never matches a real cache.
const FIRST_ID: u16 = 1;

/// Returns the cache id for `class` on `cpu`.
pub const fn cache_id(cpu: usize, class: usize) -> u16 {
    FIRST_ID + (cpu * CLASSES + class) as u16
}

/// Splits a cache id back into its cpu and size class.
pub fn decode_id(id: u16) -> Option<(usize, usize)> {
    let idx = id.checked_sub(FIRST_ID)? as usize;
    (idx < MAX_CPUS * CLASSES).then_some((idx / CLASSES, idx % CLASSES))
}

/// Returns the smallest size class which can hold `size` bytes.
pub fn class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| class >= size)
}

/// The CPU the caller is running on.
pub fn current_cpu() -> usize {
    // no APs are started, so everything runs on the BSP
    0
}

/// One CPU's set of size class caches.
pub struct CpuAllocator {
    cpu: usize,
    caches: [Spinlock<SlabCache>; CLASSES],
}

impl CpuAllocator {
    #[rustfmt::skip]
    pub const fn new(cpu: usize) -> Self {
        CpuAllocator {
            cpu,
            caches: [
                Spinlock::new(SlabCache::new("kmalloc-32", cache_id(cpu, 0), 32, CLASS_ALIGN)),
                Spinlock::new(SlabCache::new("kmalloc-64", cache_id(cpu, 1), 64, CLASS_ALIGN)),
                Spinlock::new(SlabCache::new("kmalloc-128", cache_id(cpu, 2), 128, CLASS_ALIGN)),
                Spinlock::new(SlabCache::new("kmalloc-256", cache_id(cpu, 3), 256, CLASS_ALIGN)),
                Spinlock::new(SlabCache::new("kmalloc-512", cache_id(cpu, 4), 512, CLASS_ALIGN)),
                Spinlock::new(SlabCache::new("kmalloc-1024", cache_id(cpu, 5), 1024, CLASS_ALIGN)),
                Spinlock::new(SlabCache::new("kmalloc-2048", cache_id(cpu, 6), 2048, CLASS_ALIGN)),
            ],
        }
    }

    /// Allocates an object from the cache of `class`, returning it and the cache's id.
    pub fn alloc(&self, class: usize, buddy: &Spinlock<BuddyAllocator>) -> Option<(NonNull<u8>, u16)> {
        let mut cache = self.caches.get(class)?.lock_irqsave();
        let obj = cache.alloc(buddy)?;
        Some((obj, cache.id()))
    }

    /// Frees `obj` into the cache of `class`.
    ///
    /// # Safety
    /// See [`SlabCache::free`].
    #[track_caller]
    pub unsafe fn free(&self, class: usize, obj: NonNull<u8>, buddy: &Spinlock<BuddyAllocator>) {
        // Safety: Ensured by caller
        unsafe { self.caches[class].lock_irqsave().free(obj, buddy) }
    }

    /// Releases the empty slabs of every cache, returning how many there were.
    pub fn shrink(&self, buddy: &Spinlock<BuddyAllocator>) -> usize {
        self.caches.iter().map(|c| c.lock_irqsave().shrink(buddy)).sum()
    }

    /// Counters of every cache added together.
    pub fn stats(&self) -> SlabStats {
        let mut stats = SlabStats::default();
        self.caches.iter().for_each(|c| stats.merge(c.lock_irqsave().stats()));
        stats
    }

    /// Calls `f` with each cache in order of size.
    pub fn for_each_cache(&self, mut f: impl FnMut(&SlabCache)) {
        self.caches.iter().for_each(|c| f(&*c.lock_irqsave()));
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that ids are unique and decode back to where they came from.
    #[test]
    fn ids_round_trip() {
        let mut seen = std::collections::HashSet::new();
        for cpu in 0..MAX_CPUS {
            for class in 0..CLASSES {
                let id = cache_id(cpu, class);
                assert!(seen.insert(id));
                assert_eq!(decode_id(id), Some((cpu, class)));
            }
        }
        assert_eq!(decode_id(0), None);
        assert_eq!(decode_id(cache_id(MAX_CPUS, 0)), None)
    }

    /// Tests that sizes land in the smallest class that fits.
    #[test]
    fn classes_fit() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(32), Some(0));
        assert_eq!(class_for(33), Some(1));
        assert_eq!(class_for(2048), Some(6));
        assert_eq!(class_for(2049), None)
    }

    /// Tests that each cpu's caches carry that cpu's ids.
    #[test]
    fn caches_are_per_cpu() {
        let cpu = CpuAllocator::new(2);
        let mut ids = Vec::new();
        cpu.for_each_cache(|c| ids.push((c.id(), c.object_size())));
        assert_eq!(ids.len(), CLASSES);
        assert!(ids.iter().all(|&(id, _)| decode_id(id).unwrap().0 == 2));
        assert_eq!(ids.iter().map(|&(_, size)| size).collect::<Vec<_>>(), SIZE_CLASSES)
    }
}
