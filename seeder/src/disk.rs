/* ---------------------------------------------------------------------------
    seeder - marigold's build tool
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
    seeder/src/disk.rs

    Builds the FAT16 disk image QEMU attaches as hdb
*/

use libfs::{
    BlockDevice, BufferCache, FsError, MemDisk, MountFlags, OpenFlags, SECTOR_SIZE, Vfs,
    fat::{FatDriver, FatType, FormatOptions},
};
use std::{fs, io, sync::Arc};
use thiserror::Error;

/// Where the image is written when no path is given.
pub const DISK_IMG: &str = "disk.img";

/// Image size used when none is given, in MiB.
pub const DEFAULT_SIZE_MIB: u64 = 32;

/// Smallest size which still has enough clusters to be FAT16.
pub const MIN_SIZE_MIB: u64 = 4;

/// Largest size before FAT16 would need clusters over 64 KiB.
pub const MAX_SIZE_MIB: u64 = 2048;

/// Sectors read back from the volume at once.
const CHUNK: u64 = 2048;

/// Copied onto every new image.
const README: &str = "Welcome to marigold!\n\nThis disk is mounted at / on boot, try `ls /` or `cat /README.TXT`.\n";

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("size must be between {MIN_SIZE_MIB} and {MAX_SIZE_MIB} MiB, got {0}")]
    BadSize(u64),
}

impl From<libfs::BlockError> for DiskError {
    fn from(e: libfs::BlockError) -> Self {
        DiskError::Fs(e.into())
    }
}

/// Formats a `mib` MiB FAT16 volume holding a README, then writes it to `path`.
pub fn make_disk(path: &str, mib: u64) -> Result<(), DiskError> {
    let image = build_image(mib)?;
    fs::write(path, image)?;
    Ok(())
}

/// Builds the image in memory.
fn build_image(mib: u64) -> Result<Vec<u8>, DiskError> {
    if !(MIN_SIZE_MIB..=MAX_SIZE_MIB).contains(&mib) {
        return Err(DiskError::BadSize(mib));
    }

    let sectors = mib * 1024 * 1024 / SECTOR_SIZE as u64;
    let disk = Arc::new(MemDisk::new(sectors));
    let opts = FormatOptions {
        label: Some("MARIGOLD"),
        ..FormatOptions::new(FatType::Fat16)
    };
    libfs::fat::format(&*disk, &opts)?;

    let cache = Arc::new(BufferCache::new(256));
    cache.register("disk", disk.clone())?;
    let vfs = Vfs::new();
    vfs.register_driver(Arc::new(FatDriver::new(Arc::clone(&cache))))?;
    vfs.mount("/", "disk", "fat", MountFlags::empty())?;

    let fd = vfs.open("/README.TXT", OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC)?;
    let written = vfs.write(fd, README.as_bytes());
    vfs.close(fd)?;
    written?;

    vfs.sync()?;
    vfs.unmount("/")?;

    let mut image = vec![0; sectors as usize * SECTOR_SIZE];
    for (i, chunk) in image.chunks_mut(CHUNK as usize * SECTOR_SIZE).enumerate() {
        disk.read(i as u64 * CHUNK, chunk)?;
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mounts a built image and reads the README back.
    fn read_readme(image: Vec<u8>) -> Result<String, DiskError> {
        let cache = Arc::new(BufferCache::new(64));
        cache.register("img", Arc::new(MemDisk::from_vec(image)))?;
        let vfs = Vfs::new();
        vfs.register_driver(Arc::new(FatDriver::new(Arc::clone(&cache))))?;
        vfs.mount("/", "img", "fat", MountFlags::READ_ONLY)?;

        let fd = vfs.open("/readme.txt", OpenFlags::RDONLY)?;
        let mut buf = [0; 256];
        let n = vfs.read(fd, &mut buf)?;
        vfs.close(fd)?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    #[test]
    fn image_is_fat16_with_readme() {
        let image = build_image(MIN_SIZE_MIB).unwrap();
        assert_eq!(image.len() as u64, MIN_SIZE_MIB * 1024 * 1024);
        assert_eq!(&image[510..512], &[0x55, 0xAA]);
        assert_eq!(&image[54..62], b"FAT     ");
        assert_eq!(read_readme(image).unwrap(), README);
    }

    #[test]
    fn bad_sizes_are_rejected() {
        assert!(matches!(build_image(1), Err(DiskError::BadSize(1))));
        assert!(matches!(build_image(MAX_SIZE_MIB + 1), Err(DiskError::BadSize(_))));
    }
}
