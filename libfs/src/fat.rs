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
    libfs/src/fat.rs

    FAT12/16/32 driver with VFAT long names

    The whole FAT is read into memory on mount and written back to every copy
    on close, sync and unmount. Sectors go through the shared [`BufferCache`].
*/

use crate::{
    BufferCache, DeviceId, DirEntry, FileContext, FileSystem, FileType, FsDriver, FsError, MountFlags, OpenFlags,
    Stat, path,
};
use alloc::sync::Arc;
use dir::{Attr, DirRef, RawEntry};
use file::FatFile;
use libutil::Spinlock;
use table::FatTable;
use volume::{EntryLoc, Node, Volume};

pub use bpb::{BootSector, EOC, FatType, Geometry};
pub use format::{FormatOptions, format};

mod bpb;
mod dir;
mod file;
mod format;
mod lfn;
mod table;
mod volume;

/// Mounts FAT volumes from devices registered with a buffer cache.
pub struct FatDriver {
    cache: Arc<BufferCache>,
}

impl FatDriver {
    pub fn new(cache: Arc<BufferCache>) -> Self {
        FatDriver { cache }
    }
}

impl FsDriver for FatDriver {
    fn name(&self) -> &str {
        "fat"
    }

    fn mount(&self, device: &str, flags: MountFlags) -> Result<Arc<dyn FileSystem>, FsError> {
        let dev = self.cache.device(device).ok_or(FsError::NotFound)?;
        let fs = FatFs::mount(Arc::clone(&self.cache), dev, flags)?;
        Ok(Arc::new(fs))
    }
}

/// A mounted FAT volume.
pub struct FatFs {
    vol: Spinlock<Volume>,
    geo: Geometry,
    read_only: bool,
}

impl FatFs {
    /// Reads the boot sector and FAT of `dev`.
    pub fn mount(cache: Arc<BufferCache>, dev: DeviceId, flags: MountFlags) -> Result<Self, FsError> {
        let bpb = cache.get(dev, 0)?.read(BootSector::parse)??;
        let geo = Geometry::new(&bpb)?;
        if geo.total_sectors > cache.sector_count(dev)? {
            return Err(FsError::CorruptFilesystem);
        }

        let table = FatTable::load(&cache, dev, &geo)?;
        Ok(FatFs {
            vol: Spinlock::new(Volume::new(cache, dev, geo, table)),
            geo,
            read_only: flags.contains(MountFlags::READ_ONLY),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// Number of unallocated clusters.
    pub fn free_clusters(&self) -> u32 {
        self.vol.lock().table.free_count()
    }

    fn check_writable(&self) -> Result<(), FsError> {
        match self.read_only {
            true => Err(FsError::ReadOnly),
            false => Ok(()),
        }
    }
}

impl FileSystem for FatFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<FileContext, FsError> {
        if flags.modifies() {
            self.check_writable()?;
        }

        let mut vol = self.vol.lock();
        let file = match vol.resolve(path) {
            Ok(Node::Root) if flags.writable() => return Err(FsError::IsADirectory),
            Ok(Node::Root) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => return Err(FsError::FileExists),
            Ok(Node::Root) => FatFile::root(&vol),

            Ok(Node::Entry { found, .. }) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(FsError::FileExists);
                }
                if found.raw.is_dir() && (flags.writable() || flags.contains(OpenFlags::TRUNC)) {
                    return Err(FsError::IsADirectory);
                }
                if flags.modifies() && found.raw.attr().contains(Attr::READ_ONLY) {
                    return Err(FsError::PermissionDenied);
                }

                let mut file = FatFile::new(&found.raw, found.loc, flags.writable());
                if flags.contains(OpenFlags::TRUNC) && (file.first_cluster != 0 || file.size != 0) {
                    vol.table.free_chain(file.first_cluster)?;
                    file.truncate();
                    vol.commit(&mut file)?;
                    vol.flush()?;
                }
                file
            }

            Err(FsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                let (parent, name) = path::split(path).ok_or(FsError::InvalidParam)?;
                let parent = vol.resolve_dir(parent)?;
                let found = vol.create(parent, name, Attr::ARCHIVE, 0)?;
                vol.flush()?;
                FatFile::new(&found.raw, found.loc, flags.writable())
            }

            Err(e) => return Err(e),
        };

        Ok(FileContext::new(file))
    }

    fn read(&self, file: &mut FileContext, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = file.downcast_mut::<FatFile>()?;
        self.vol.lock().read_file(file, offset, buf)
    }

    fn write(&self, file: &mut FileContext, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        self.check_writable()?;
        let file = file.downcast_mut::<FatFile>()?;
        if !file.writable {
            return Err(FsError::BadDescriptor);
        }
        self.vol.lock().write_file(file, offset, buf)
    }

    fn size(&self, file: &FileContext) -> Result<u64, FsError> {
        Ok(file.downcast_ref::<FatFile>()?.size as u64)
    }

    fn close(&self, file: FileContext) -> Result<(), FsError> {
        let mut file = file.into_inner::<FatFile>()?;
        let mut vol = self.vol.lock();
        vol.commit(&mut file)?;
        if file.writable {
            vol.flush()?;
        }
        Ok(())
    }

    fn readdir(&self, dir: &mut FileContext, index: usize) -> Result<Option<DirEntry>, FsError> {
        let dir = dir.downcast_mut::<FatFile>()?;
        self.vol.lock().readdir(dir, index)
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let mut vol = self.vol.lock();
        let (parent, found) = match vol.resolve(path)? {
            Node::Root => return Err(FsError::PermissionDenied),
            Node::Entry { parent, found } => (parent, found),
        };

        if found.raw.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if found.raw.attr().contains(Attr::READ_ONLY) {
            return Err(FsError::PermissionDenied);
        }

        vol.table.free_chain(found.raw.cluster())?;
        vol.remove(parent, &found)?;
        vol.flush()
    }

    fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let mut vol = self.vol.lock();
        match vol.resolve(path) {
            Ok(_) => return Err(FsError::FileExists),
            Err(FsError::NotFound) => (),
            Err(e) => return Err(e),
        }

        let (parent_path, name) = path::split(path).ok_or(FsError::InvalidParam)?;
        let parent = vol.resolve_dir(parent_path)?;
        let cluster = vol.allocate_cluster(0)?;

        // `..` points at cluster 0 when the parent is the root
        let dotdot = match parent {
            DirRef::Chain(c) if c != self.geo.root_cluster => c,
            _ => 0,
        };
        let lba = self.geo.cluster_lba(cluster);
        let dots = [
            RawEntry::new(b".          ", Attr::DIRECTORY, cluster, 0),
            RawEntry::new(b"..         ", Attr::DIRECTORY, dotdot, 0),
        ];

        let res = dots
            .iter()
            .enumerate()
            .try_for_each(|(i, dot)| vol.write_entry(EntryLoc { lba, offset: i * 32 }, dot))
            .and_then(|_| vol.create(parent, name, Attr::DIRECTORY, cluster));

        if let Err(e) = res {
            vol.table.free_chain(cluster)?;
            return Err(e);
        }
        vol.flush()
    }

    fn stat(&self, path: &str) -> Result<Stat, FsError> {
        let vol = self.vol.lock();
        let stat = match vol.resolve(path)? {
            Node::Root => Stat {
                size: 0,
                kind: FileType::Directory,
                inode: self.geo.root_cluster as u64,
                read_only: self.read_only,
            },
            Node::Entry { found, .. } => Stat {
                size: found.raw.size() as u64,
                kind: if found.raw.is_dir() { FileType::Directory } else { FileType::Regular },
                inode: found.raw.cluster() as u64,
                read_only: self.read_only || found.raw.attr().contains(Attr::READ_ONLY),
            },
        };
        Ok(stat)
    }

    fn sync(&self) -> Result<(), FsError> {
        self.vol.lock().flush()
    }

    fn unmount(&self) -> Result<(), FsError> {
        let mut vol = self.vol.lock();
        vol.flush()?;
        vol.cache.invalidate(vol.dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockDevice, MemDisk, SECTOR_SIZE, Vfs};
    use alloc::{string::String, vec, vec::Vec};

    const TYPES: [(FatType, u64); 3] = [(FatType::Fat12, 2880), (FatType::Fat16, 8192), (FatType::Fat32, 70000)];

    fn disk(kind: FatType, sectors: u64) -> (Arc<BufferCache>, DeviceId, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(sectors));
        format(&*disk, &FormatOptions::new(kind)).unwrap();
        let cache = Arc::new(BufferCache::new(64));
        let dev = cache.register("hda", disk.clone()).unwrap();
        (cache, dev, disk)
    }

    fn mounted(kind: FatType, sectors: u64) -> Vfs {
        let (cache, _, _) = disk(kind, sectors);
        let vfs = Vfs::new();
        vfs.register_driver(Arc::new(FatDriver::new(cache))).unwrap();
        vfs.mount("/", "hda", "fat", MountFlags::empty()).unwrap();
        vfs
    }

    fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
        let fd = vfs.open(path, OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY).unwrap();
        assert_eq!(vfs.write(fd, data).unwrap(), data.len());
        vfs.close(fd).unwrap()
    }

    fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
        let fd = vfs.open(path, OpenFlags::RDONLY).unwrap();
        let mut out = Vec::new();
        let mut buf = [0; 1000];
        loop {
            match vfs.read(fd, &mut buf).unwrap() {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        vfs.close(fd).unwrap();
        out
    }

    fn names(vfs: &Vfs, path: &str) -> Vec<String> {
        vfs.list_dir(path).unwrap().into_iter().map(|e| e.name).collect()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    /// Tests writing `hi\n` to a new file then reading it back.
    #[test]
    fn hello_file() {
        let vfs = mounted(FatType::Fat16, 8192);
        let fd = vfs.open("/hello.txt", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        assert_eq!(vfs.write(fd, b"hi\n").unwrap(), 3);
        vfs.close(fd).unwrap();

        let fd = vfs.open("/hello.txt", OpenFlags::RDONLY).unwrap();
        let mut buf = [0; 8];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
        vfs.close(fd).unwrap();
        assert_eq!(names(&vfs, "/"), ["hello.txt"])
    }

    /// Tests that file contents of many sizes come back identical on every FAT type.
    #[test]
    fn contents_round_trip() {
        for (kind, sectors) in TYPES {
            let vfs = mounted(kind, sectors);
            for len in [0, 1, 511, 512, 513, 4096, 4097, 40000, 65536] {
                let data = pattern(len);
                write_file(&vfs, "/data.bin", &data);
                assert_eq!(vfs.stat("/data.bin").unwrap().size, len as u64, "{}", kind.name());
                assert_eq!(read_file(&vfs, "/data.bin"), data, "{} {len}", kind.name());
            }
        }
    }

    /// Tests that files are still there after remounting.
    #[test]
    fn survives_remount() {
        let (cache, _, _) = disk(FatType::Fat32, 70000);
        let vfs = Vfs::new();
        vfs.register_driver(Arc::new(FatDriver::new(cache.clone()))).unwrap();
        vfs.mount("/", "hda", "fat", MountFlags::empty()).unwrap();
        vfs.mkdir("/etc").unwrap();
        write_file(&vfs, "/etc/motd", &pattern(3000));
        vfs.unmount("/").unwrap();
        assert_eq!(cache.stats().entries, 0);

        vfs.mount("/mnt", "hda", "fat", MountFlags::READ_ONLY).unwrap();
        assert_eq!(read_file(&vfs, "/mnt/etc/motd"), pattern(3000));
        assert_eq!(names(&vfs, "/mnt"), ["etc"])
    }

    /// Tests that long and unicode names are listed exactly as created.
    #[test]
    fn long_names() {
        let long = "n".repeat(200);
        let created = ["a rather long file name.txt", "Grüße.txt", "README.TXT", long.as_str(), "mixedCase.Md"];

        for (kind, sectors) in TYPES {
            let vfs = mounted(kind, sectors);
            for (i, name) in created.iter().enumerate() {
                write_file(&vfs, &path::join("/", name), &[i as u8]);
            }

            assert_eq!(names(&vfs, "/"), created);
            assert_eq!(read_file(&vfs, "/A RATHER LONG FILE NAME.TXT"), [0]);
            assert_eq!(read_file(&vfs, "/readme.txt"), [2]);
        }
    }

    /// Tests that names which map to the same 8.3 name are refused.
    #[test]
    fn short_name_collisions() {
        let vfs = mounted(FatType::Fat16, 8192);
        write_file(&vfs, "/hello world.txt", b"1");
        assert_eq!(
            vfs.open("/helloworld.txt", OpenFlags::CREAT | OpenFlags::WRONLY),
            Err(FsError::NameCollision)
        );
        assert_eq!(vfs.open("/bad:name", OpenFlags::CREAT), Err(FsError::InvalidParam));
        assert_eq!(vfs.open("/hello world.txt", OpenFlags::CREAT | OpenFlags::EXCL), Err(FsError::FileExists))
    }

    /// Tests creating and using nested directories.
    #[test]
    fn directories() {
        for (kind, sectors) in TYPES {
            let vfs = mounted(kind, sectors);
            vfs.mkdir("/docs").unwrap();
            vfs.mkdir("/docs/notes").unwrap();
            write_file(&vfs, "/docs/notes/todo.txt", b"water the marigolds");
            write_file(&vfs, "/docs/a.txt", b"a");

            assert_eq!(names(&vfs, "/docs"), ["notes", "a.txt"]);
            assert_eq!(read_file(&vfs, "/docs/notes/todo.txt"), b"water the marigolds");
            assert_eq!(vfs.stat("/docs").unwrap().kind, FileType::Directory);
            assert_eq!(vfs.stat("/docs/a.txt").unwrap().kind, FileType::Regular);

            assert_eq!(vfs.mkdir("/docs"), Err(FsError::FileExists));
            assert_eq!(vfs.mkdir("/nope/x"), Err(FsError::NotFound));
            assert_eq!(vfs.mkdir("/docs/a.txt/x"), Err(FsError::NotADirectory));
            assert_eq!(vfs.open("/docs", OpenFlags::WRONLY), Err(FsError::IsADirectory));
            assert_eq!(vfs.unlink("/docs"), Err(FsError::IsADirectory));
            assert_eq!(vfs.list_dir("/docs/a.txt"), Err(FsError::NotADirectory))
        }
    }

    /// Tests the `.` and `..` entries written by mkdir.
    #[test]
    fn dot_entries() {
        let (cache, dev, _) = disk(FatType::Fat16, 8192);
        let fs = FatFs::mount(cache, dev, MountFlags::empty()).unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();

        let vol = fs.vol.lock();
        let Node::Entry { found: a, .. } = vol.resolve("/a").unwrap() else { panic!("/a is the root") };
        let Node::Entry { found: b, .. } = vol.resolve("/a/b").unwrap() else { panic!("/a/b is the root") };

        let entry = |cluster: u32, slot: usize| {
            let lba = fs.geo.cluster_lba(cluster);
            vol.read_entry(EntryLoc { lba, offset: slot * 32 }).unwrap()
        };
        assert_eq!((entry(a.raw.cluster(), 0).cluster(), entry(a.raw.cluster(), 1).cluster()), (a.raw.cluster(), 0));
        assert_eq!(entry(b.raw.cluster(), 1).cluster(), a.raw.cluster());
        assert!(entry(b.raw.cluster(), 0).is_dot() && entry(b.raw.cluster(), 1).is_dir())
    }

    /// Tests that unlinking frees clusters and deletes the long name entries too.
    #[test]
    fn unlink_frees_everything() {
        let (cache, dev, disk) = disk(FatType::Fat16, 8192);
        let fs = FatFs::mount(cache, dev, MountFlags::empty()).unwrap();
        let free = fs.free_clusters();

        let mut file = fs.open("/a long name.txt", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        fs.write(&mut file, 0, &[1; 3000]).unwrap();
        fs.close(file).unwrap();
        assert_eq!(fs.free_clusters(), free - 6);

        fs.unlink("/a long name.txt").unwrap();
        assert_eq!(fs.free_clusters(), free);
        assert_eq!(fs.stat("/a long name.txt"), Err(FsError::NotFound));

        // two long name entries then the 8.3 one
        let mut root = [0; SECTOR_SIZE];
        disk.read(fs.geo.root_dir_start, &mut root).unwrap();
        assert_eq!([root[0], root[32], root[64], root[96]], [0xE5, 0xE5, 0xE5, 0x00]);

        // the deleted slots get reused
        drop(fs.open("/b.txt", OpenFlags::CREAT).unwrap());
        let vol = fs.vol.lock();
        let Node::Entry { found, .. } = vol.resolve("/b.txt").unwrap() else { panic!("/b.txt is the root") };
        assert_eq!((found.first_slot, found.slot), (0, 1))
    }

    /// Tests that FAT12's fixed root directory fills up.
    #[test]
    fn root_directory_fills() {
        let vfs = mounted(FatType::Fat12, 2880);
        for i in 0..224 {
            let fd = vfs.open(&alloc::format!("/F{i}.TXT"), OpenFlags::CREAT).unwrap();
            vfs.close(fd).unwrap();
        }
        assert_eq!(vfs.open("/ONEMORE.TXT", OpenFlags::CREAT), Err(FsError::OutOfSpace));
        assert_eq!(vfs.list_dir("/").unwrap().len(), 224)
    }

    /// Tests that a full volume returns what it managed to write.
    #[test]
    fn volume_fills() {
        let vfs = mounted(FatType::Fat12, 2880);
        let fd = vfs.open("/big", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        let data = vec![0xAA; 2 * 1024 * 1024];
        assert_eq!(vfs.write(fd, &data).unwrap(), 2847 * 512);
        assert_eq!(vfs.write(fd, b"x"), Err(FsError::OutOfSpace));
        vfs.close(fd).unwrap();
        assert_eq!(vfs.stat("/big").unwrap().size, 2847 * 512)
    }

    /// Tests truncating, then writing past the end leaving a hole.
    #[test]
    fn truncate_and_holes() {
        let (cache, dev, _) = disk(FatType::Fat16, 8192);
        let fs = FatFs::mount(cache, dev, MountFlags::empty()).unwrap();
        let free = fs.free_clusters();

        let mut file = fs.open("/log", OpenFlags::CREAT | OpenFlags::RDWR).unwrap();
        fs.write(&mut file, 0, &pattern(5000)).unwrap();
        fs.close(file).unwrap();

        let file = fs.open("/log", OpenFlags::TRUNC | OpenFlags::WRONLY).unwrap();
        assert_eq!(fs.size(&file), Ok(0));
        assert_eq!(fs.free_clusters(), free);
        fs.close(file).unwrap();

        let mut file = fs.open("/log", OpenFlags::RDWR).unwrap();
        fs.write(&mut file, 1500, b"end").unwrap();
        assert_eq!(fs.size(&file), Ok(1503));

        let mut buf = [0xFF; 1503];
        assert_eq!(fs.read(&mut file, 0, &mut buf), Ok(1503));
        assert!(buf[..1500].iter().all(|&b| b == 0));
        assert_eq!(&buf[1500..], b"end");
        assert_eq!(fs.read(&mut file, 1503, &mut buf), Ok(0));
        fs.close(file).unwrap()
    }

    /// Tests that read-only entries and mounts refuse changes.
    #[test]
    fn read_only() {
        let (cache, dev, _) = disk(FatType::Fat16, 8192);
        let fs = FatFs::mount(cache.clone(), dev, MountFlags::empty()).unwrap();
        fs.close(fs.open("/RO.TXT", OpenFlags::CREAT).unwrap()).unwrap();

        {
            let vol = fs.vol.lock();
            let Node::Entry { found, .. } = vol.resolve("/RO.TXT").unwrap() else { panic!("/RO.TXT is the root") };
            let mut raw = found.raw;
            raw.0[11] |= Attr::READ_ONLY.bits();
            vol.write_entry(found.loc, &raw).unwrap();
        }

        assert_eq!(fs.open("/RO.TXT", OpenFlags::WRONLY).err(), Some(FsError::PermissionDenied));
        assert_eq!(fs.unlink("/RO.TXT"), Err(FsError::PermissionDenied));
        assert!(fs.stat("/RO.TXT").unwrap().read_only);
        fs.close(fs.open("/RO.TXT", OpenFlags::RDONLY).unwrap()).unwrap();
        fs.unmount().unwrap();

        let fs = FatFs::mount(cache, dev, MountFlags::READ_ONLY).unwrap();
        assert_eq!(fs.open("/new", OpenFlags::CREAT).err(), Some(FsError::ReadOnly));
        assert_eq!(fs.mkdir("/dir"), Err(FsError::ReadOnly));
        assert!(fs.stat("/").unwrap().read_only)
    }

    /// Tests reading a directory in order, then starting over.
    #[test]
    fn readdir_cursor() {
        let vfs = mounted(FatType::Fat32, 70000);
        for name in ["one", "two", "three"] {
            write_file(&vfs, &path::join("/", name), b"");
        }

        let fd = vfs.open("/", OpenFlags::RDONLY).unwrap();
        let read = |i| vfs.readdir(fd, i).unwrap().map(|e| e.name);
        assert_eq!(
            (read(0), read(1), read(2), read(3)),
            (Some("one".into()), Some("two".into()), Some("three".into()), None)
        );
        assert_eq!((read(2), read(0)), (Some("three".into()), Some("one".into())));
        vfs.close(fd).unwrap()
    }

    /// Tests that devices without a FAT volume don't mount.
    #[test]
    fn rejects_unformatted() {
        let cache = Arc::new(BufferCache::new(8));
        let dev = cache.register("hda", Arc::new(MemDisk::new(2880))).unwrap();
        assert_eq!(FatFs::mount(cache.clone(), dev, MountFlags::empty()).err(), Some(FsError::CorruptFilesystem));

        let driver = FatDriver::new(cache);
        assert_eq!(driver.mount("hdz", MountFlags::empty()).err(), Some(FsError::NotFound))
    }
}
