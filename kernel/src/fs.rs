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
    kernel/src/fs.rs

    Connects the ATA drives, buffer cache and FAT driver to the VFS,
    then mounts the root filesystem
*/

use crate::{
    ata,
    startup::{self, ExitCode},
};
use alloc::sync::Arc;
use libfs::{BufferCache, FsError, MountFlags, Vfs, fat::FatDriver};
use libutil::InitLater;

/// Every mounted filesystem and open file.
pub static VFS: Vfs = Vfs::new();

/// Sectors shared by every mounted filesystem, also owns the device table.
pub static CACHE: InitLater<Arc<BufferCache>> = InitLater::uninit();

/// How many sectors the cache holds before it starts evicting.
const CACHE_SECTORS: usize = 512;

/// The device mounted at `/`, set through the VERSION file.
pub const ROOT_DEVICE: &str = env!("MGK_ROOT_DEVICE");

/// The driver used for `/`, set through the VERSION file.
pub const ROOT_FS: &str = env!("MGK_ROOT_FS");

/// Creates the buffer cache, gives it every drive and registers the FAT driver.
///
/// # Safety
/// Only run once, after the heap and drives are ready.
pub unsafe fn init() -> ExitCode<FsError> {
    if !startup::HEAP_INIT.load() {
        return ExitCode::Error(FsError::NotInitialised);
    }

    let Ok(cache) = CACHE.init(Arc::new(BufferCache::new(CACHE_SECTORS))) else {
        return ExitCode::Error(FsError::Busy);
    };

    if let Ok(drives) = ata::DRIVES.read() {
        for drive in drives {
            exit_on_err!(cache.register(drive.name(), drive.clone()));
        }
    }

    exit_on_err!(VFS.register_driver(Arc::new(FatDriver::new(Arc::clone(cache)))));
    ExitCode::Ok
}

/// Mounts the root device at `/`.
///
/// # Safety
/// Only run once, after [`init`].
pub unsafe fn mount_root() -> ExitCode<FsError> {
    exit_on_err!(VFS.mount("/", ROOT_DEVICE, ROOT_FS, MountFlags::empty()));
    dbg_info!("fs: mounted {ROOT_DEVICE} ({ROOT_FS}) at /");
    ExitCode::Ok
}

/// Writes every dirty sector back to it's drive.
pub fn sync() -> Result<(), FsError> {
    VFS.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use libfs::{
        MemDisk, OpenFlags, Whence,
        fat::{self, FatType, FormatOptions},
    };

    /// Writes `data` to `path` then reads it back.
    fn write_then_read(path: &str, data: &[u8]) {
        let fd = VFS.open(path, OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC).unwrap();
        assert_eq!(VFS.write(fd, data).unwrap(), data.len());
        VFS.close(fd).unwrap();

        let fd = VFS.open(path, OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0; data.len() + 5];
        assert_eq!(VFS.read(fd, &mut buf).unwrap(), data.len());
        assert_eq!(&buf[..data.len()], data);
        VFS.close(fd).unwrap();
    }

    /// Tests the write then read flow on a FAT12 ram disk.
    #[test_case]
    fn ram_disk_round_trip() {
        let cache = CACHE.read().unwrap();
        let disk = Arc::new(MemDisk::new(2880));
        fat::format(&*disk, &FormatOptions::new(FatType::Fat12)).unwrap();
        cache.register("ram0", disk).unwrap();

        VFS.mount("/ram", "ram0", "fat", MountFlags::empty()).unwrap();
        assert_eq!(
            VFS.mount("/ram", "ram0", "fat", MountFlags::empty()),
            Err(FsError::FileExists)
        );

        write_then_read("/ram/hello.txt", b"hi\n");

        VFS.mkdir("/ram/Some Long Directory").unwrap();
        let big: alloc::vec::Vec<u8> = (0..20_000).map(|i| (i % 253) as u8).collect();
        write_then_read("/ram/Some Long Directory/a longer file name.bin", &big);

        let fd = VFS.open("/ram/Some Long Directory/a longer file name.bin", OpenFlags::RDONLY).unwrap();
        assert_eq!(VFS.lseek(fd, -3, Whence::End).unwrap(), 19_997);
        VFS.close(fd).unwrap();

        let names: alloc::vec::Vec<_> =
            VFS.list_dir("/ram/Some Long Directory").unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.iter().any(|n| n == "a longer file name.bin"));

        VFS.unlink("/ram/hello.txt").unwrap();
        assert_eq!(VFS.open("/ram/hello.txt", OpenFlags::RDONLY), Err(FsError::NotFound));

        VFS.unmount("/ram").unwrap();
        assert!(VFS.list_mounts().iter().all(|m| m.point != "/ram"));
    }

    /// Tests that the root filesystem takes a small file.
    #[test_case]
    fn root_round_trip() {
        write_then_read("/hello.txt", b"hi\n");
        VFS.unlink("/hello.txt").unwrap();
        sync().unwrap();
    }
}
