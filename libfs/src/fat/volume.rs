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
    libfs/src/fat/volume.rs

    A mounted volume's state, and the directory operations built on it
*/

use super::bpb::{FatType, Geometry};
use super::dir::{self, Attr, DirRef, ENTRIES_PER_SECTOR, ENTRY_SIZE, RawEntry};
use super::lfn::{self, Collector};
use super::table::FatTable;
use crate::{BufferCache, DeviceId, FsError, SECTOR_SIZE, path};
use alloc::{string::String, sync::Arc, vec, vec::Vec};

/// Characters which can't appear in any name.
const INVALID_CHARS: &str = "\"*/:<>?\\|";

pub(super) struct Volume {
    pub cache: Arc<BufferCache>,
    pub dev: DeviceId,
    pub geo: Geometry,
    pub table: FatTable,
    /// One cluster long, allocated on first use.
    bounce: Option<Vec<u8>>,
}

/// Where an entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct EntryLoc {
    pub lba: u64,
    pub offset: usize,
}

/// An entry found while walking a directory.
pub(super) struct Found {
    pub name: String,
    pub raw: RawEntry,
    pub loc: EntryLoc,
    /// Slot of the 8.3 entry.
    pub slot: usize,
    /// Slot of the first long name entry, or `slot` if there aren't any.
    pub first_slot: usize,
}

/// What a path resolved to.
pub(super) enum Node {
    Root,
    Entry { parent: DirRef, found: Found },
}

/// Walks the entries of a directory, assembling long names as it goes.
pub(super) struct Walker<'a> {
    vol: &'a Volume,
    sectors: &'a [u64],
    slot: usize,
    lfn: Collector,
    lfn_start: Option<usize>,
}

impl Walker<'_> {
    pub fn next_entry(&mut self) -> Result<Option<Found>, FsError> {
        while let Some(loc) = slot_loc(self.sectors, self.slot) {
            let raw = self.vol.read_entry(loc)?;
            let slot = self.slot;
            self.slot += 1;

            if raw.is_end() {
                self.slot = self.sectors.len() * ENTRIES_PER_SECTOR;
                return Ok(None);
            }

            if raw.is_deleted() || raw.is_volume_label() {
                self.lfn.reset();
                self.lfn_start = None;
                continue;
            }

            if raw.is_long_name() {
                if raw.0[0] & lfn::LAST_ENTRY != 0 || self.lfn_start.is_none() {
                    self.lfn_start = Some(slot);
                }
                self.lfn.push(&raw.0);
                continue;
            }

            let long = self.lfn.finish(raw.short_name());
            let first_slot = match long {
                Some(_) => self.lfn_start.unwrap_or(slot),
                None => slot,
            };
            self.lfn_start = None;

            return Ok(Some(Found {
                name: long.unwrap_or_else(|| raw.display_name()),
                raw,
                loc,
                slot,
                first_slot,
            }));
        }
        Ok(None)
    }

    /// Slot the next call starts reading from.
    pub fn position(&self) -> usize {
        self.slot
    }
}

/// Where slot `slot` of a directory made of `sectors` lives.
pub(super) fn slot_loc(sectors: &[u64], slot: usize) -> Option<EntryLoc> {
    Some(EntryLoc {
        lba: *sectors.get(slot / ENTRIES_PER_SECTOR)?,
        offset: (slot % ENTRIES_PER_SECTOR) * ENTRY_SIZE,
    })
}

impl Volume {
    pub fn new(cache: Arc<BufferCache>, dev: DeviceId, geo: Geometry, table: FatTable) -> Self {
        Volume {
            cache,
            dev,
            geo,
            table,
            bounce: None,
        }
    }

    pub fn root(&self) -> DirRef {
        match self.geo.fat_type {
            FatType::Fat32 => DirRef::Chain(self.geo.root_cluster),
            _ => DirRef::FixedRoot,
        }
    }

    /// The directory starting at `cluster`, where 0 means the root.
    pub fn dir_ref(&self, cluster: u32) -> DirRef {
        match cluster {
            0 => self.root(),
            c => DirRef::Chain(c),
        }
    }

    /// Every sector making up `dir`, in order.
    pub fn dir_sectors(&self, dir: DirRef) -> Result<Vec<u64>, FsError> {
        match dir {
            DirRef::FixedRoot => Ok((0..self.geo.root_dir_sectors as u64)
                .map(|s| self.geo.root_dir_start + s)
                .collect()),
            DirRef::Chain(start) => {
                self.check_cluster(start)?;
                let spc = self.geo.sectors_per_cluster as u64;
                let sectors = self
                    .table
                    .chain(start)?
                    .into_iter()
                    .flat_map(|c| (0..spc).map(move |s| (c, s)))
                    .map(|(c, s)| self.geo.cluster_lba(c) + s)
                    .collect();
                Ok(sectors)
            }
        }
    }

    pub fn read_entry(&self, loc: EntryLoc) -> Result<RawEntry, FsError> {
        let mut raw = RawEntry([0; ENTRY_SIZE]);
        self.cache.get(self.dev, loc.lba)?.copy_to(loc.offset, &mut raw.0)?;
        Ok(raw)
    }

    pub fn write_entry(&self, loc: EntryLoc, raw: &RawEntry) -> Result<(), FsError> {
        self.cache.get(self.dev, loc.lba)?.copy_from(loc.offset, &raw.0)
    }

    pub fn walk<'a>(&'a self, sectors: &'a [u64], start: usize) -> Walker<'a> {
        Walker {
            vol: self,
            sectors,
            slot: start,
            lfn: Collector::default(),
            lfn_start: None,
        }
    }

    /// Finds `name` in `dir`, ignoring ASCII case.
    pub fn lookup(&self, dir: DirRef, name: &str) -> Result<Option<Found>, FsError> {
        let sectors = self.dir_sectors(dir)?;
        let mut walker = self.walk(&sectors, 0);

        while let Some(found) = walker.next_entry()? {
            if !found.raw.is_dot()
                && (found.name.eq_ignore_ascii_case(name) || found.raw.display_name().eq_ignore_ascii_case(name))
            {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Follows a normalized path from the root.
    pub fn resolve(&self, path: &str) -> Result<Node, FsError> {
        let mut node = Node::Root;
        for name in path::components(path) {
            let dir = self.node_dir(&node)?;
            let found = self.lookup(dir, name)?.ok_or(FsError::NotFound)?;
            node = Node::Entry { parent: dir, found };
        }
        Ok(node)
    }

    /// Resolves a path which has to be a directory.
    pub fn resolve_dir(&self, path: &str) -> Result<DirRef, FsError> {
        let node = self.resolve(path)?;
        self.node_dir(&node)
    }

    fn node_dir(&self, node: &Node) -> Result<DirRef, FsError> {
        match node {
            Node::Root => Ok(self.root()),
            Node::Entry { found, .. } if found.raw.is_dir() => Ok(self.dir_ref(found.raw.cluster())),
            Node::Entry { .. } => Err(FsError::NotADirectory),
        }
    }

    /// Finds `count` consecutive free slots, returning the first.
    pub fn find_slots(&self, sectors: &[u64], count: usize) -> Result<usize, FsError> {
        let total = sectors.len() * ENTRIES_PER_SECTOR;
        let mut run = 0;

        for slot in 0..total {
            let raw = self.read_entry(slot_loc(sectors, slot).ok_or(FsError::Internal)?)?;
            if raw.is_end() {
                // everything past the end is free too
                let start = slot - run;
                return if total - start >= count { Ok(start) } else { Err(FsError::OutOfSpace) };
            }

            if raw.is_deleted() {
                run += 1;
                if run == count {
                    return Ok(slot + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        Err(FsError::OutOfSpace)
    }

    /// Adds an entry for `name` to `parent`, preceded by long name entries if it needs them.
    pub fn create(&self, parent: DirRef, name: &str, attr: Attr, cluster: u32) -> Result<Found, FsError> {
        if name == "." || name == ".." || name.chars().any(|c| c < ' ' || INVALID_CHARS.contains(c)) {
            return Err(FsError::InvalidParam);
        }
        lfn::encode(name)?;

        let short = dir::short_name(name);
        let sectors = self.dir_sectors(parent)?;
        let mut walker = self.walk(&sectors, 0);
        while let Some(found) = walker.next_entry()? {
            if found.raw.short_name() == &short {
                return Err(FsError::NameCollision);
            }
        }

        let long = match dir::needs_long_name(name, &short) {
            true => lfn::entries(name, &short)?,
            false => Vec::new(),
        };

        let first_slot = self.find_slots(&sectors, long.len() + 1)?;
        for (i, entry) in long.iter().enumerate() {
            let loc = slot_loc(&sectors, first_slot + i).ok_or(FsError::Internal)?;
            self.write_entry(loc, &RawEntry(*entry))?;
        }

        let slot = first_slot + long.len();
        let loc = slot_loc(&sectors, slot).ok_or(FsError::Internal)?;
        let raw = RawEntry::new(&short, attr, cluster, 0);
        self.write_entry(loc, &raw)?;

        Ok(Found {
            name: String::from(name),
            raw,
            loc,
            slot,
            first_slot,
        })
    }

    /// Marks an entry and all of it's long name entries as deleted.
    pub fn remove(&self, parent: DirRef, found: &Found) -> Result<(), FsError> {
        let sectors = self.dir_sectors(parent)?;
        for slot in found.first_slot..=found.slot {
            let loc = slot_loc(&sectors, slot).ok_or(FsError::Internal)?;
            let mut raw = self.read_entry(loc)?;
            raw.mark_deleted();
            self.write_entry(loc, &raw)?;
        }
        Ok(())
    }

    pub fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<(), FsError> {
        let lba = self.check_cluster(cluster)?;
        for (i, chunk) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            self.cache.get(self.dev, lba + i as u64)?.copy_to(0, chunk)?;
        }
        Ok(())
    }

    /// Overwrites the start of `cluster` with `buf`.
    pub fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        let lba = self.check_cluster(cluster)?;
        for (i, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
            self.cache.get_zeroed(self.dev, lba + i as u64)?.copy_from(0, chunk)?;
        }
        Ok(())
    }

    pub fn zero_cluster(&self, cluster: u32) -> Result<(), FsError> {
        let lba = self.check_cluster(cluster)?;
        for s in 0..self.geo.sectors_per_cluster as u64 {
            drop(self.cache.get_zeroed(self.dev, lba + s)?);
        }
        Ok(())
    }

    /// Allocates a zeroed cluster, appending it to `prev` if that's a cluster.
    pub fn allocate_cluster(&mut self, prev: u32) -> Result<u32, FsError> {
        let cluster = self.table.allocate(prev)?;
        self.zero_cluster(cluster)?;
        Ok(cluster)
    }

    /// Runs `f` with the cluster sized bounce buffer.
    pub fn with_bounce<R>(&mut self, f: impl FnOnce(&mut Self, &mut [u8]) -> Result<R, FsError>) -> Result<R, FsError> {
        let mut bounce = self.bounce.take().unwrap_or_else(|| vec![0; self.geo.cluster_size]);
        let res = f(self, &mut bounce);
        self.bounce = Some(bounce);
        res
    }

    /// Writes the FAT and every cached sector of this volume back to the device.
    pub fn flush(&mut self) -> Result<(), FsError> {
        self.table.flush(&self.cache, self.dev, &self.geo)?;
        self.cache.sync_device(self.dev)
    }

    /// Returns the first sector of `cluster`, if it's a data cluster.
    fn check_cluster(&self, cluster: u32) -> Result<u64, FsError> {
        match self.geo.is_data_cluster(cluster) {
            true => Ok(self.geo.cluster_lba(cluster)),
            false => Err(FsError::CorruptFilesystem),
        }
    }
}
