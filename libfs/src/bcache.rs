/* ---------------------------------------------------------------------------
    libfs - marigold kernel filesystem library
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
    libfs/src/bcache.rs

    A write-back cache of sectors, keyed by device and LBA. The cache also
    owns the table of named block devices, so filesystems refer to a disk
    by its [`DeviceId`].
*/

use crate::{BlockDevice, FsError, SECTOR_SIZE};
use alloc::{boxed::Box, collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use libutil::Spinlock;

/// Longest run of dirty sectors written back in a single request.
const MAX_WRITEBACK_RUN: usize = 128;

/// Index of a device in the cache's device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u16);

/// Counters kept by the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub writebacks: usize,
    pub entries: usize,
    pub dirty: usize,
}

pub struct BufferCache {
    inner: Spinlock<Inner>,
}

struct Inner {
    devices: Vec<Device>,
    entries: BTreeMap<(DeviceId, u64), Entry>,
    capacity: usize,
    /// Bumped on every access, used to find the least recently used entry.
    clock: u64,
    stats: CacheStats,
}

struct Device {
    name: String,
    dev: Arc<dyn BlockDevice>,
}

struct Entry {
    data: Box<[u8; SECTOR_SIZE]>,
    dirty: bool,
    pins: u32,
    last_used: u64,
}

/// A pinned sector, which can't be evicted until this is dropped.
pub struct Buffer<'a> {
    cache: &'a BufferCache,
    dev: DeviceId,
    lba: u64,
}

impl BufferCache {
    /// Creates a cache holding up to `capacity` sectors.
    pub const fn new(capacity: usize) -> Self {
        BufferCache {
            inner: Spinlock::new(Inner {
                devices: Vec::new(),
                entries: BTreeMap::new(),
                capacity,
                clock: 0,
                stats: CacheStats {
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    writebacks: 0,
                    entries: 0,
                    dirty: 0,
                },
            }),
        }
    }

    /// Adds `dev` to the device table under `name`.
    pub fn register(&self, name: &str, dev: Arc<dyn BlockDevice>) -> Result<DeviceId, FsError> {
        let mut inner = self.inner.lock();
        if inner.devices.iter().any(|d| d.name == name) {
            return Err(FsError::FileExists);
        }

        let id = DeviceId(u16::try_from(inner.devices.len()).map_err(|_| FsError::OutOfSpace)?);
        inner.devices.push(Device {
            name: String::from(name),
            dev,
        });
        Ok(id)
    }

    /// Looks up a device by name.
    pub fn device(&self, name: &str) -> Option<DeviceId> {
        let inner = self.inner.lock();
        let idx = inner.devices.iter().position(|d| d.name == name)?;
        Some(DeviceId(idx as u16))
    }

    /// Names of every registered device.
    pub fn device_names(&self) -> Vec<String> {
        self.inner.lock().devices.iter().map(|d| d.name.clone()).collect()
    }

    /// Number of sectors on `dev`.
    pub fn sector_count(&self, dev: DeviceId) -> Result<u64, FsError> {
        Ok(self.inner.lock().device(dev)?.sector_count())
    }

    /// Returns the sector at `lba` on `dev`, reading it from the device if it isn't cached.
    pub fn get(&self, dev: DeviceId, lba: u64) -> Result<Buffer<'_>, FsError> {
        self.pin(dev, lba, true)
    }

    /// Returns the sector at `lba` on `dev` filled with zeros, without reading it.
    /// The sector is marked dirty.
    pub fn get_zeroed(&self, dev: DeviceId, lba: u64) -> Result<Buffer<'_>, FsError> {
        let buf = self.pin(dev, lba, false)?;
        buf.write(|data| data.fill(0))?;
        Ok(buf)
    }

    /// Writes every dirty sector back to its device, in ascending device then LBA order.
    pub fn sync(&self) -> Result<(), FsError> {
        self.inner.lock().writeback(None)
    }

    /// Writes every dirty sector of `dev` back.
    pub fn sync_device(&self, dev: DeviceId) -> Result<(), FsError> {
        self.inner.lock().writeback(Some(dev))
    }

    /// Writes back then forgets every sector of `dev`.
    ///
    /// Fails with `Busy` if any of them are still pinned.
    pub fn invalidate(&self, dev: DeviceId) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|(key, e)| key.0 == dev && e.pins > 0) {
            return Err(FsError::Busy);
        }

        inner.writeback(Some(dev))?;
        inner.entries.retain(|key, _| key.0 != dev);
        inner.stats.entries = inner.entries.len();
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            dirty: inner.entries.values().filter(|e| e.dirty).count(),
            ..inner.stats
        }
    }

    fn pin(&self, dev: DeviceId, lba: u64, read: bool) -> Result<Buffer<'_>, FsError> {
        let mut inner = self.inner.lock();
        let device = inner.device(dev)?;
        if lba >= device.sector_count() {
            return Err(FsError::InvalidParam);
        }

        inner.clock += 1;
        let clock = inner.clock;

        if let Some(entry) = inner.entries.get_mut(&(dev, lba)) {
            entry.pins += 1;
            entry.last_used = clock;
            inner.stats.hits += 1;
            return Ok(Buffer { cache: self, dev, lba });
        }

        inner.stats.misses += 1;
        if inner.entries.len() >= inner.capacity {
            inner.evict()?;
        }

        let mut data = Box::new([0; SECTOR_SIZE]);
        if read {
            device.read(lba, &mut data[..])?;
        }

        inner.entries.insert(
            (dev, lba),
            Entry {
                data,
                dirty: false,
                pins: 1,
                last_used: clock,
            },
        );
        inner.stats.entries = inner.entries.len();
        Ok(Buffer { cache: self, dev, lba })
    }
}

impl Inner {
    fn device(&self, dev: DeviceId) -> Result<Arc<dyn BlockDevice>, FsError> {
        match self.devices.get(dev.0 as usize) {
            Some(d) => Ok(Arc::clone(&d.dev)),
            None => Err(FsError::NotFound),
        }
    }

    /// Removes the least recently used unpinned entry, writing it back first if needed.
    fn evict(&mut self) -> Result<(), FsError> {
        let Some((&key, _)) = self
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .min_by_key(|(_, e)| e.last_used)
        else {
            return Err(FsError::Busy);
        };

        if let Some(entry) = self.entries.get(&key)
            && entry.dirty
        {
            self.device(key.0)?.write(key.1, &entry.data[..])?;
            self.stats.writebacks += 1;
        }

        self.entries.remove(&key);
        self.stats.evictions += 1;
        Ok(())
    }

    /// Writes back dirty entries of `only` (or every device), merging runs of adjacent sectors.
    fn writeback(&mut self, only: Option<DeviceId>) -> Result<(), FsError> {
        let dirty: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, e)| e.dirty && only.is_none_or(|dev| key.0 == dev))
            .map(|(key, _)| *key)
            .collect();

        let mut touched: Vec<DeviceId> = Vec::new();
        let mut run: Vec<u8> = Vec::new();
        let mut i = 0;

        while i < dirty.len() {
            let (dev, start) = dirty[i];
            let mut len = 1;
            while i + len < dirty.len() && len < MAX_WRITEBACK_RUN && dirty[i + len] == (dev, start + len as u64) {
                len += 1;
            }

            run.clear();
            for key in &dirty[i..i + len] {
                if let Some(entry) = self.entries.get(key) {
                    run.extend_from_slice(&entry.data[..]);
                }
            }

            self.device(dev)?.write(start, &run)?;
            for key in &dirty[i..i + len] {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.dirty = false;
                }
            }

            self.stats.writebacks += len;
            if !touched.contains(&dev) {
                touched.push(dev);
            }
            i += len;
        }

        for dev in touched {
            self.device(dev)?.flush()?;
        }
        Ok(())
    }
}

impl Buffer<'_> {
    /// Runs `f` on the sector's contents.
    pub fn read<R>(&self, f: impl FnOnce(&[u8; SECTOR_SIZE]) -> R) -> Result<R, FsError> {
        let inner = self.cache.inner.lock();
        let entry = inner.entries.get(&(self.dev, self.lba)).ok_or(FsError::Internal)?;
        Ok(f(&entry.data))
    }

    /// Runs `f` on the sector's contents then marks it dirty.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> R) -> Result<R, FsError> {
        let mut inner = self.cache.inner.lock();
        let entry = inner.entries.get_mut(&(self.dev, self.lba)).ok_or(FsError::Internal)?;
        entry.dirty = true;
        Ok(f(&mut entry.data))
    }

    /// Copies `len` bytes starting at `offset` into `out`.
    pub fn copy_to(&self, offset: usize, out: &mut [u8]) -> Result<(), FsError> {
        self.read(|data| out.copy_from_slice(&data[offset..offset + out.len()]))
    }

    /// Copies `src` into the sector starting at `offset`.
    pub fn copy_from(&self, offset: usize, src: &[u8]) -> Result<(), FsError> {
        self.write(|data| data[offset..offset + src.len()].copy_from_slice(src))
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.cache.inner.lock().entries.get_mut(&(self.dev, self.lba)) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockError, MemDisk};

    /// A disk remembering every write request it got.
    struct Recorder {
        disk: MemDisk,
        writes: Spinlock<Vec<(u64, usize)>>,
    }

    impl Recorder {
        fn new(sectors: u64) -> Arc<Self> {
            Arc::new(Recorder {
                disk: MemDisk::new(sectors),
                writes: Spinlock::new(Vec::new()),
            })
        }
    }

    impl BlockDevice for Recorder {
        fn sector_count(&self) -> u64 {
            self.disk.sector_count()
        }

        fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
            self.disk.read(lba, buf)
        }

        fn write(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
            self.writes.lock().push((lba, buf.len() / SECTOR_SIZE));
            self.disk.write(lba, buf)
        }
    }

    /// Tests that a second get of the same sector hits.
    #[test]
    fn hits_after_miss() {
        let cache = BufferCache::new(8);
        let dev = cache.register("hda", Arc::new(MemDisk::new(16))).unwrap();

        drop(cache.get(dev, 3).unwrap());
        let buf = cache.get(dev, 3).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert_eq!(buf.lba(), 3);
        assert_eq!(cache.get(dev, 16).err(), Some(FsError::InvalidParam))
    }

    /// Tests that device names are unique.
    #[test]
    fn device_table() {
        let cache = BufferCache::new(8);
        let a = cache.register("hda", Arc::new(MemDisk::new(1))).unwrap();
        let b = cache.register("hdb", Arc::new(MemDisk::new(2))).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.register("hda", Arc::new(MemDisk::new(1))).err(), Some(FsError::FileExists));
        assert_eq!(cache.device("hdb"), Some(b));
        assert_eq!(cache.device("hdc"), None);
        assert_eq!(cache.sector_count(b), Ok(2));
        assert_eq!(cache.device_names(), ["hda", "hdb"])
    }

    /// Tests that sync writes in ascending order, merging adjacent sectors.
    #[test]
    fn sync_is_ordered() {
        let cache = BufferCache::new(16);
        let disk = Recorder::new(64);
        let dev = cache.register("hda", disk.clone()).unwrap();

        for lba in [9, 2, 3, 40, 4] {
            cache.get(dev, lba).unwrap().copy_from(0, &[lba as u8; 4]).unwrap();
        }
        assert_eq!(cache.stats().dirty, 5);
        cache.sync().unwrap();

        assert_eq!(*disk.writes.lock(), [(2, 3), (9, 1), (40, 1)]);
        assert_eq!(cache.stats().dirty, 0);

        let mut sector = [0; SECTOR_SIZE];
        disk.read(40, &mut sector).unwrap();
        assert_eq!(&sector[..5], &[40, 40, 40, 40, 0])
    }

    /// Tests that the least recently used clean sector gets evicted, and dirty ones are written first.
    #[test]
    fn evicts_lru() {
        let cache = BufferCache::new(2);
        let disk = Recorder::new(8);
        let dev = cache.register("hda", disk.clone()).unwrap();

        cache.get(dev, 0).unwrap().copy_from(0, b"zero").unwrap();
        drop(cache.get(dev, 1).unwrap());
        drop(cache.get(dev, 0).unwrap());
        drop(cache.get(dev, 2).unwrap()); // evicts 1
        assert!(disk.writes.lock().is_empty());

        drop(cache.get(dev, 3).unwrap()); // evicts 0, which is dirty
        assert_eq!(*disk.writes.lock(), [(0, 1)]);
        assert_eq!(cache.stats().evictions, 2);

        let mut out = [0; 4];
        cache.get(dev, 0).unwrap().copy_to(0, &mut out).unwrap();
        assert_eq!(&out, b"zero")
    }

    /// Tests that a cache full of pinned buffers refuses new ones.
    #[test]
    fn pinned_buffers_stay() {
        let cache = BufferCache::new(2);
        let dev = cache.register("hda", Arc::new(MemDisk::new(8))).unwrap();
        let _a = cache.get(dev, 0).unwrap();
        let b = cache.get(dev, 1).unwrap();
        assert_eq!(cache.get(dev, 2).err(), Some(FsError::Busy));
        assert_eq!(cache.invalidate(dev), Err(FsError::Busy));
        drop(b);
        assert!(cache.get(dev, 2).is_ok())
    }

    /// Tests that invalidating a device writes it back and empties the cache.
    #[test]
    fn invalidate_writes_back() {
        let cache = BufferCache::new(4);
        let disk = Arc::new(MemDisk::new(8));
        let dev = cache.register("hda", disk.clone()).unwrap();

        cache.get_zeroed(dev, 5).unwrap().copy_from(10, b"hey").unwrap();
        cache.invalidate(dev).unwrap();
        assert_eq!(cache.stats().entries, 0);

        let mut sector = [0xFF; SECTOR_SIZE];
        disk.read(5, &mut sector).unwrap();
        assert_eq!(&sector[9..14], b"\0hey\0")
    }
}
