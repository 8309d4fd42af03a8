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
    libfs/src/fat/file.rs

    Reading, writing and listing open files
*/

use super::dir::{DirRef, RawEntry};
use super::volume::{EntryLoc, Volume};
use crate::{DirEntry, FileType, FsError};

/// A FAT file or directory, kept in it's `FileContext`.
pub(super) struct FatFile {
    pub first_cluster: u32,
    pub size: u32,
    pub is_dir: bool,
    /// Where the 8.3 entry lives, `None` for the root directory.
    pub loc: Option<EntryLoc>,
    pub writable: bool,
    /// Whether the size or first cluster changed since the entry was written.
    pub dirty: bool,
    /// The last cluster visited and it's index in the chain.
    pos: Option<(u32, u32)>,
    /// Index of the next directory entry and the slot to continue from.
    cursor: (usize, usize),
}

impl FatFile {
    pub fn new(raw: &RawEntry, loc: EntryLoc, writable: bool) -> Self {
        FatFile {
            first_cluster: raw.cluster(),
            size: raw.size(),
            is_dir: raw.is_dir(),
            loc: Some(loc),
            writable,
            dirty: false,
            pos: None,
            cursor: (0, 0),
        }
    }

    pub fn root(vol: &Volume) -> Self {
        FatFile {
            first_cluster: vol.geo.root_cluster,
            size: 0,
            is_dir: true,
            loc: None,
            writable: false,
            dirty: false,
            pos: None,
            cursor: (0, 0),
        }
    }

    fn dir_ref(&self, vol: &Volume) -> DirRef {
        match self.loc {
            None => vol.root(),
            Some(_) => vol.dir_ref(self.first_cluster),
        }
    }

    /// Forgets the file's clusters.
    pub fn truncate(&mut self) {
        self.first_cluster = 0;
        self.size = 0;
        self.pos = None;
        self.dirty = true;
    }
}

impl Volume {
    /// Reads from `offset`, stopping at the end of the file.
    pub fn read_file(&mut self, file: &mut FatFile, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if file.is_dir {
            return Err(FsError::IsADirectory);
        }

        let size = file.size as u64;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min((size - offset) as usize);
        let cs = self.geo.cluster_size;
        let index = (offset / cs as u64) as u32;
        let Some(mut cluster) = self.seek_cluster(file, index)? else {
            return Err(FsError::CorruptFilesystem);
        };

        self.with_bounce(|vol, bounce| {
            let mut read = 0;
            let mut index = index;
            loop {
                let within = ((offset + read as u64) % cs as u64) as usize;
                let n = (len - read).min(cs - within);
                if n == cs {
                    vol.read_cluster(cluster, &mut buf[read..read + n])?;
                } else {
                    vol.read_cluster(cluster, bounce)?;
                    buf[read..read + n].copy_from_slice(&bounce[within..within + n]);
                }

                read += n;
                if read == len {
                    return Ok(read);
                }

                match vol.table.next(cluster)? {
                    Some(next) => cluster = next,
                    None => return Ok(read),
                }
                index += 1;
                file.pos = Some((index, cluster));
            }
        })
    }

    /// Writes at `offset`, growing the file's chain as needed.
    ///
    /// Running out of space part way through returns what was written.
    pub fn write_file(&mut self, file: &mut FatFile, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        if file.is_dir {
            return Err(FsError::IsADirectory);
        }
        if offset >= u32::MAX as u64 {
            return Err(FsError::OutOfSpace);
        }

        let len = buf.len().min((u32::MAX as u64 - offset) as usize);
        if len == 0 {
            return Ok(0);
        }

        if file.first_cluster == 0 {
            file.first_cluster = self.allocate_cluster(0)?;
            file.pos = None;
            file.dirty = true;
        }

        let cs = self.geo.cluster_size;
        let mut index = (offset / cs as u64) as u32;
        let mut cluster = self.seek_cluster_growing(file, index)?;

        self.with_bounce(|vol, bounce| {
            let mut written = 0;
            loop {
                let pos = offset + written as u64;
                let within = (pos % cs as u64) as usize;
                let n = (len - written).min(cs - within);
                if n == cs {
                    vol.write_cluster(cluster, &buf[written..written + n])?;
                } else {
                    vol.read_cluster(cluster, bounce)?;
                    bounce[within..within + n].copy_from_slice(&buf[written..written + n]);
                    vol.write_cluster(cluster, bounce)?;
                }

                written += n;
                file.size = file.size.max((pos + n as u64) as u32);
                file.dirty = true;
                if written == len {
                    return Ok(written);
                }

                cluster = match vol.table.next(cluster)? {
                    Some(next) => next,
                    None => match vol.allocate_cluster(cluster) {
                        Ok(new) => new,
                        Err(FsError::OutOfSpace) => return Ok(written),
                        Err(e) => return Err(e),
                    },
                };
                index += 1;
                file.pos = Some((index, cluster));
            }
        })
    }

    /// Writes the file's size and first cluster back into it's entry if they changed.
    pub fn commit(&self, file: &mut FatFile) -> Result<(), FsError> {
        let Some(loc) = file.loc else {
            return Ok(());
        };

        if file.dirty {
            let mut raw = self.read_entry(loc)?;
            raw.set_cluster(file.first_cluster);
            raw.set_size(if file.is_dir { 0 } else { file.size });
            self.write_entry(loc, &raw)?;
            file.dirty = false;
        }
        Ok(())
    }

    /// Returns the `index`th entry of a directory, skipping `.` and `..`.
    ///
    /// Reading entries in order continues from where the last call stopped.
    pub fn readdir(&self, file: &mut FatFile, index: usize) -> Result<Option<DirEntry>, FsError> {
        if !file.is_dir {
            return Err(FsError::NotADirectory);
        }

        let sectors = self.dir_sectors(file.dir_ref(self))?;
        let (mut count, start) = if index >= file.cursor.0 { file.cursor } else { (0, 0) };
        let mut walker = self.walk(&sectors, start);

        while let Some(found) = walker.next_entry()? {
            if found.raw.is_dot() {
                continue;
            }

            if count == index {
                file.cursor = (index + 1, walker.position());
                return Ok(Some(DirEntry {
                    kind: if found.raw.is_dir() { FileType::Directory } else { FileType::Regular },
                    inode: found.raw.cluster() as u64,
                    size: found.raw.size() as u64,
                    name: found.name,
                }));
            }
            count += 1;
        }

        file.cursor = (0, 0);
        Ok(None)
    }

    /// Returns the `index`th cluster of the file, or `None` if the chain is shorter.
    fn seek_cluster(&self, file: &mut FatFile, index: u32) -> Result<Option<u32>, FsError> {
        if file.first_cluster == 0 {
            return Ok(None);
        }

        let (mut at, mut cluster) = match file.pos {
            Some((at, cluster)) if at <= index => (at, cluster),
            _ => (0, file.first_cluster),
        };

        while at < index {
            match self.table.next(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
            at += 1;
            file.pos = Some((at, cluster));
        }

        file.pos = Some((at, cluster));
        Ok(Some(cluster))
    }

    /// Like [`seek_cluster`](Self::seek_cluster), but allocates clusters past the end of the chain.
    fn seek_cluster_growing(&mut self, file: &mut FatFile, index: u32) -> Result<u32, FsError> {
        let (mut at, mut cluster) = match file.pos {
            Some((at, cluster)) if at <= index => (at, cluster),
            _ => (0, file.first_cluster),
        };

        while at < index {
            cluster = match self.table.next(cluster)? {
                Some(next) => next,
                None => self.allocate_cluster(cluster)?,
            };
            at += 1;
            file.pos = Some((at, cluster));
        }

        file.pos = Some((at, cluster));
        Ok(cluster)
    }
}
