/* ---------------------------------------------------------------------------
    libfs - Sunflower kernel filesystem library, sunflowerkernel.org
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
    libfs/src/lib.rs

    Library root file

    Everything between a block device and a file descriptor:
    - [`block`] - the trait drivers implement, plus an in-memory disk
    - [`bcache`] - sector cache shared by every mounted filesystem
    - [`vfs`] - driver registry, mount table and descriptor table
    - [`fat`] - FAT12/16/32 with long file names

    Note: Sectors are 512 bytes in length.
*/

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use bcache::{Buffer, BufferCache, CacheStats, DeviceId};
pub use block::{BlockDevice, MemDisk, SECTOR_SIZE};
pub use error::{BlockError, FsError};
pub use vfs::{
    DirEntry, Fd, FileContext, FileSystem, FileType, FsDriver, MAX_FDS, MountFlags, MountInfo, OpenFlags, Stat, Vfs,
    Whence,
};

pub mod bcache;
pub mod block;
pub mod error;
pub mod fat;
pub mod path;
pub mod vfs;
