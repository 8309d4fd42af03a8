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
    libfs/src/fat/table.rs

    The file allocation table, kept entirely in memory while a volume is mounted
*/

use super::bpb::{EOC, FatType, Geometry, le16, le32, put16, put32};
use crate::{BufferCache, DeviceId, FsError, SECTOR_SIZE};
use alloc::{vec, vec::Vec};

pub struct FatTable {
    kind: FatType,
    data: Vec<u8>,
    /// One flag per sector of `data`.
    dirty: Vec<bool>,
    /// Number of entries, including the two reserved ones.
    entries: u32,
}

impl FatTable {
    /// Creates a table of zeros `sectors` long.
    pub fn blank(kind: FatType, sectors: u32, entries: u32) -> Self {
        FatTable {
            kind,
            data: vec![0; sectors as usize * SECTOR_SIZE],
            dirty: vec![false; sectors as usize],
            entries,
        }
    }

    /// Reads the first copy of the FAT through the cache.
    pub fn load(cache: &BufferCache, dev: DeviceId, geo: &Geometry) -> Result<Self, FsError> {
        let mut table = FatTable::blank(geo.fat_type, geo.fat_size, geo.cluster_count + 2);
        for (i, chunk) in table.data.chunks_mut(SECTOR_SIZE).enumerate() {
            cache.get(dev, geo.fat_start + i as u64)?.copy_to(0, chunk)?;
        }
        Ok(table)
    }

    /// Reads the raw entry for `cluster`, with any end of chain value canonicalised to [`EOC`].
    pub fn get(&self, cluster: u32) -> Result<u32, FsError> {
        if cluster >= self.entries {
            return Err(FsError::CorruptFilesystem);
        }

        let val = match self.kind {
            FatType::Fat12 => {
                let val = le16(&self.data, Self::fat12_offset(cluster));
                u32::from(if cluster & 1 == 1 { val >> 4 } else { val & 0xFFF })
            }
            FatType::Fat16 => u32::from(le16(&self.data, cluster as usize * 2)),
            FatType::Fat32 => le32(&self.data, cluster as usize * 4) & 0x0FFFFFFF,
        };

        Ok(if val >= self.kind.eoc_min() { EOC } else { val })
    }

    /// Returns the cluster after `cluster`, or `None` at the end of the chain.
    pub fn next(&self, cluster: u32) -> Result<Option<u32>, FsError> {
        match self.get(cluster)? {
            EOC => Ok(None),
            next if next >= 2 && next < self.entries => Ok(Some(next)),
            _ => Err(FsError::CorruptFilesystem),
        }
    }

    /// Sets the entry for `cluster`. [`EOC`] is stored as the type's own end of chain value.
    pub fn set(&mut self, cluster: u32, val: u32) -> Result<(), FsError> {
        if cluster >= self.entries {
            return Err(FsError::CorruptFilesystem);
        }

        let val = if val == EOC { self.kind.eoc_max() } else { val };
        let (offset, width) = match self.kind {
            FatType::Fat12 => {
                let offset = Self::fat12_offset(cluster);
                let old = le16(&self.data, offset);
                let new = if cluster & 1 == 1 {
                    (old & 0x000F) | ((val as u16) << 4)
                } else {
                    (old & 0xF000) | (val as u16 & 0x0FFF)
                };
                put16(&mut self.data, offset, new);
                (offset, 2)
            }
            FatType::Fat16 => {
                put16(&mut self.data, cluster as usize * 2, val as u16);
                (cluster as usize * 2, 2)
            }
            FatType::Fat32 => {
                let offset = cluster as usize * 4;
                let old = le32(&self.data, offset);
                put32(&mut self.data, offset, (old & 0xF0000000) | (val & 0x0FFFFFFF));
                (offset, 4)
            }
        };

        self.dirty[offset / SECTOR_SIZE] = true;
        self.dirty[(offset + width - 1) / SECTOR_SIZE] = true;
        Ok(())
    }

    /// Returns the first free cluster, or 0 if there aren't any.
    pub fn find_free(&self) -> u32 {
        (2..self.entries).find(|&c| self.get(c) == Ok(0)).unwrap_or(0)
    }

    /// Allocates a cluster and marks it as the end of a chain, appending it to `prev` if that's a cluster.
    pub fn allocate(&mut self, prev: u32) -> Result<u32, FsError> {
        let new = self.find_free();
        if new == 0 {
            return Err(FsError::OutOfSpace);
        }

        self.set(new, EOC)?;
        if prev >= 2
            && let Err(e) = self.set(prev, new)
        {
            self.set(new, 0)?;
            return Err(e);
        }
        Ok(new)
    }

    /// Frees every cluster in the chain starting at `start`.
    pub fn free_chain(&mut self, start: u32) -> Result<(), FsError> {
        let mut cluster = start;
        for _ in 0..self.entries {
            if cluster < 2 || cluster >= self.entries {
                return Ok(());
            }

            let next = self.get(cluster)?;
            self.set(cluster, 0)?;
            if next == EOC {
                return Ok(());
            }
            cluster = next;
        }
        Err(FsError::CorruptFilesystem)
    }

    /// Every cluster in the chain starting at `start`.
    pub fn chain(&self, start: u32) -> Result<Vec<u32>, FsError> {
        let mut chain = Vec::new();
        let mut cluster = Some(start);
        while let Some(c) = cluster {
            if chain.len() >= self.entries as usize {
                // longer than the volume, so it must loop
                return Err(FsError::CorruptFilesystem);
            }
            chain.push(c);
            cluster = self.next(c)?;
        }
        Ok(chain)
    }

    pub fn free_count(&self) -> u32 {
        (2..self.entries).filter(|&c| self.get(c) == Ok(0)).count() as u32
    }

    /// The whole table as it's stored on disk.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Writes every modified sector to every copy of the FAT.
    pub fn flush(&mut self, cache: &BufferCache, dev: DeviceId, geo: &Geometry) -> Result<(), FsError> {
        for (i, chunk) in self.data.chunks(SECTOR_SIZE).enumerate() {
            if !self.dirty[i] {
                continue;
            }

            for copy in 0..geo.num_fats {
                let lba = geo.fat_start + (copy * geo.fat_size) as u64 + i as u64;
                cache.get_zeroed(dev, lba)?.copy_from(0, chunk)?;
            }
            self.dirty[i] = false;
        }
        Ok(())
    }

    fn fat12_offset(cluster: u32) -> usize {
        cluster as usize + cluster as usize / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that neighbouring FAT12 entries don't clobber each other.
    #[test]
    fn fat12_packing() {
        let mut table = FatTable::blank(FatType::Fat12, 1, 300);
        table.set(2, 0xABC).unwrap();
        table.set(3, 0x123).unwrap();
        table.set(4, EOC).unwrap();

        assert_eq!(&table.bytes()[3..6], [0xBC, 0x3A, 0x12]);
        assert_eq!(table.get(2), Ok(0xABC));
        assert_eq!(table.get(3), Ok(0x123));
        assert_eq!(table.get(4), Ok(EOC));
        assert_eq!(table.bytes()[6..8], [0xFF, 0x0F]);
    }

    /// Tests that FAT12 entries straddling a sector boundary dirty both sectors.
    #[test]
    fn fat12_straddles_sectors() {
        let mut table = FatTable::blank(FatType::Fat12, 2, 600);
        // entry 341 lives at bytes 511 and 512
        table.set(341, 0x456).unwrap();
        assert_eq!(table.dirty, [true, true]);
        assert_eq!(table.get(341), Ok(0x456));
        assert_eq!(table.get(340), Ok(0));
        assert_eq!(table.get(342), Ok(0))
    }

    /// Tests that the reserved top bits of FAT32 entries are kept.
    #[test]
    fn fat32_keeps_reserved_bits() {
        let mut table = FatTable::blank(FatType::Fat32, 1, 128);
        put32(&mut table.data, 5 * 4, 0xA000_0000);
        table.set(5, 0x1234).unwrap();
        assert_eq!(le32(table.bytes(), 20), 0xA000_1234);
        assert_eq!(table.get(5), Ok(0x1234));

        table.set(5, 0x0FFF_FFF8).unwrap();
        assert_eq!(table.get(5), Ok(EOC))
    }

    /// Tests allocating, chaining and freeing clusters.
    #[test]
    fn allocate_and_free() {
        let mut table = FatTable::blank(FatType::Fat16, 1, 16);
        let a = table.allocate(0).unwrap();
        let b = table.allocate(a).unwrap();
        let c = table.allocate(b).unwrap();
        assert_eq!((a, b, c), (2, 3, 4));
        assert_eq!(table.chain(a).unwrap(), [2, 3, 4]);
        assert_eq!(table.free_count(), 11);

        table.free_chain(a).unwrap();
        assert_eq!(table.free_count(), 14);
        assert_eq!(table.find_free(), 2)
    }

    /// Tests that a full table reports running out of space.
    #[test]
    fn out_of_space() {
        let mut table = FatTable::blank(FatType::Fat16, 1, 4);
        let a = table.allocate(0).unwrap();
        table.allocate(a).unwrap();
        assert_eq!(table.find_free(), 0);
        assert_eq!(table.allocate(a), Err(FsError::OutOfSpace));
    }

    /// Tests that a failed link rolls the new cluster back.
    #[test]
    fn allocate_rolls_back() {
        let mut table = FatTable::blank(FatType::Fat16, 1, 8);
        assert_eq!(table.allocate(100), Err(FsError::CorruptFilesystem));
        assert_eq!(table.free_count(), 6)
    }

    /// Tests that looping chains are detected.
    #[test]
    fn detects_cycles() {
        let mut table = FatTable::blank(FatType::Fat16, 1, 8);
        table.set(2, 3).unwrap();
        table.set(3, 2).unwrap();
        assert_eq!(table.chain(2), Err(FsError::CorruptFilesystem));
        assert_eq!(table.free_chain(2), Ok(()));

        table.set(4, 1).unwrap();
        assert_eq!(table.next(4), Err(FsError::CorruptFilesystem))
    }
}
