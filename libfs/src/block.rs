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
    libfs/src/block.rs

    The interface every block driver implements.
*/

use crate::BlockError;
use alloc::{vec, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use libutil::Spinlock;

/// The numbers of bytes in a sector.
pub const SECTOR_SIZE: usize = 512;

/// A device addressed in 512 byte sectors.
///
/// Buffers passed to `read` and `write` are always a whole number of sectors long.
pub trait BlockDevice: Send + Sync {
    /// Total number of addressable sectors.
    fn sector_count(&self) -> u64;

    /// Reads `buf.len() / SECTOR_SIZE` sectors starting at `lba` into `buf`.
    fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf` to the device starting at `lba`.
    fn write(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError>;

    /// Makes sure everything written so far has reached the medium.
    fn flush(&self) -> Result<(), BlockError> {
        Ok(())
    }
}

/// Checks that a request of `len` bytes at `lba` fits on a device of `sectors` sectors,
/// returning the number of sectors it covers.
pub fn check_request(lba: u64, len: usize, sectors: u64) -> Result<u64, BlockError> {
    if len == 0 || !len.is_multiple_of(SECTOR_SIZE) {
        return Err(BlockError::Params);
    }

    let count = (len / SECTOR_SIZE) as u64;
    match lba.checked_add(count) {
        Some(end) if end <= sectors => Ok(count),
        _ => Err(BlockError::Bounds),
    }
}

/// A disk which lives in memory, used for tests and building images.
pub struct MemDisk {
    data: Spinlock<Vec<u8>>,
    sectors: u64,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    /// Creates a zeroed disk of `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        Self::from_vec(vec![0; sectors as usize * SECTOR_SIZE])
    }

    /// Wraps an existing image, which is truncated to a whole number of sectors.
    pub fn from_vec(mut data: Vec<u8>) -> Self {
        data.truncate(data.len() - data.len() % SECTOR_SIZE);
        MemDisk {
            sectors: (data.len() / SECTOR_SIZE) as u64,
            data: Spinlock::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Consumes the disk, returning its contents.
    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_inner()
    }

    /// Number of (read, write) requests served so far.
    pub fn requests(&self) -> (usize, usize) {
        (self.reads.load(Ordering::Relaxed), self.writes.load(Ordering::Relaxed))
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        check_request(lba, buf.len(), self.sectors)?;
        let start = lba as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        check_request(lba, buf.len(), self.sectors)?;
        let start = lba as usize * SECTOR_SIZE;
        self.data.lock()[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
