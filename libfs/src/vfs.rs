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
    libfs/src/vfs.rs

    The virtual filesystem: drivers register by name, mounted filesystems
    live in a table searched by longest matching prefix, and open files are
    handed out as small integer descriptors.
*/

use crate::{FsError, path};
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use bitflags::bitflags;
use core::any::Any;
use libutil::Spinlock;

pub use fd::{Fd, MAX_FDS};
pub use mount::MountInfo;

use fd::{FdTable, OpenFile};
use mount::{Mount, MountTable};

mod fd;
mod mount;

bitflags! {
    /// How a file is opened. The low two bits are the access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 1;
        const RDWR = 2;
        const CREAT = 0x100;
        const TRUNC = 0x200;
        const APPEND = 0x400;
        const EXCL = 0x800;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    /// Whether reads are allowed.
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    /// Whether writes are allowed.
    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }

    /// Whether opening with these flags could modify the filesystem.
    pub fn modifies(&self) -> bool {
        self.writable() || self.intersects(OpenFlags::CREAT | OpenFlags::TRUNC)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Refuse everything which could modify the filesystem.
        const READ_ONLY = 1;
    }
}

/// Where [`Vfs::lseek`] offsets are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl TryFrom<u32> for Whence {
    type Error = FsError;

    fn try_from(val: u32) -> Result<Self, FsError> {
        match val {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(FsError::InvalidParam),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
}

/// One record returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Driver defined number identifying the file.
    pub inode: u64,
    pub kind: FileType,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub kind: FileType,
    pub inode: u64,
    pub read_only: bool,
}

/// Whatever a driver needs to remember about an open file.
pub struct FileContext(Box<dyn Any + Send>);

impl FileContext {
    pub fn new<T: Any + Send>(val: T) -> Self {
        FileContext(Box::new(val))
    }

    pub fn downcast_ref<T: Any>(&self) -> Result<&T, FsError> {
        self.0.downcast_ref().ok_or(FsError::BadDescriptor)
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Result<&mut T, FsError> {
        self.0.downcast_mut().ok_or(FsError::BadDescriptor)
    }

    pub fn into_inner<T: Any>(self) -> Result<T, FsError> {
        match self.0.downcast() {
            Ok(val) => Ok(*val),
            Err(_) => Err(FsError::BadDescriptor),
        }
    }
}

/// A mounted filesystem. Every path it's given is absolute and relative to it's own root.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<FileContext, FsError>;

    /// Reads from `offset` into `buf`, returning how many bytes were read.
    fn read(&self, file: &mut FileContext, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at `offset`, returning how many bytes were written.
    fn write(&self, file: &mut FileContext, offset: u64, buf: &[u8]) -> Result<usize, FsError>;

    /// Current size of an open file.
    fn size(&self, file: &FileContext) -> Result<u64, FsError>;

    /// Commits any metadata changes made through `file`.
    fn close(&self, file: FileContext) -> Result<(), FsError>;

    /// Returns the `index`th entry of an open directory, or `None` past the last one.
    fn readdir(&self, dir: &mut FileContext, index: usize) -> Result<Option<DirEntry>, FsError>;

    fn unlink(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn mkdir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn stat(&self, path: &str) -> Result<Stat, FsError>;

    /// Writes everything cached back to the device.
    fn sync(&self) -> Result<(), FsError>;

    /// Flushes and releases the filesystem, it won't be used again afterwards.
    fn unmount(&self) -> Result<(), FsError>;
}

/// Something which can mount filesystems of a given type.
pub trait FsDriver: Send + Sync {
    /// The filesystem type, like `fat`.
    fn name(&self) -> &str;

    fn mount(&self, device: &str, flags: MountFlags) -> Result<Arc<dyn FileSystem>, FsError>;
}

pub struct Vfs {
    drivers: Spinlock<Vec<Arc<dyn FsDriver>>>,
    mounts: Spinlock<MountTable>,
    fds: Spinlock<FdTable>,
}

/// A path resolved to the filesystem it lives on.
struct Resolved {
    fs: Arc<dyn FileSystem>,
    point: String,
    /// The path relative to the filesystem's root.
    rel: String,
    flags: MountFlags,
}

impl Vfs {
    pub const fn new() -> Self {
        Vfs {
            drivers: Spinlock::new(Vec::new()),
            mounts: Spinlock::new(MountTable::new()),
            fds: Spinlock::new(FdTable::new()),
        }
    }

    /// Makes a filesystem type available to [`mount`](Self::mount).
    pub fn register_driver(&self, driver: Arc<dyn FsDriver>) -> Result<(), FsError> {
        let mut drivers = self.drivers.lock();
        if drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(FsError::FileExists);
        }
        drivers.push(driver);
        Ok(())
    }

    /// Removes a filesystem type, which mustn't have anything mounted.
    pub fn unregister_driver(&self, name: &str) -> Result<(), FsError> {
        if self.mounts.lock().uses_driver(name) {
            return Err(FsError::Busy);
        }

        let mut drivers = self.drivers.lock();
        let idx = drivers.iter().position(|d| d.name() == name).ok_or(FsError::NotFound)?;
        drivers.remove(idx);
        Ok(())
    }

    /// Names of every registered driver.
    pub fn drivers(&self) -> Vec<String> {
        self.drivers.lock().iter().map(|d| String::from(d.name())).collect()
    }

    /// Mounts `device` at `point` using the `fs_name` driver.
    pub fn mount(&self, point: &str, device: &str, fs_name: &str, flags: MountFlags) -> Result<(), FsError> {
        let point = path::normalize(point)?;
        if self.mounts.lock().get(&point).is_some() {
            return Err(FsError::FileExists);
        }

        let driver = {
            let drivers = self.drivers.lock();
            let driver = drivers.iter().find(|d| d.name() == fs_name).ok_or(FsError::NotFound)?;
            Arc::clone(driver)
        };

        let fs = driver.mount(device, flags)?;
        let mount = Mount {
            point,
            fs_name: String::from(fs_name),
            device: String::from(device),
            flags,
            fs: Arc::clone(&fs),
        };

        if let Err(e) = self.mounts.lock().insert(mount) {
            // someone else got there first
            _ = fs.unmount();
            return Err(e);
        }
        Ok(())
    }

    /// Unmounts whatever is mounted at `point`.
    pub fn unmount(&self, point: &str) -> Result<(), FsError> {
        let point = path::normalize(point)?;
        // Held until the mount is gone so nothing can be opened on it meanwhile
        let fds = self.fds.lock();
        if fds.uses_mount(&point) {
            return Err(FsError::Busy);
        }

        let fs = match self.mounts.lock().get(&point) {
            Some(mount) => Arc::clone(&mount.fs),
            None => return Err(FsError::NotFound),
        };

        fs.unmount()?;
        self.mounts.lock().remove(&point);
        drop(fds);
        Ok(())
    }

    /// Every mounted filesystem, in the order they were mounted.
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.mounts.lock().list()
    }

    /// Opens `path`, returning a descriptor.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        let res = self.resolve(path)?;
        if flags.modifies() && res.flags.contains(MountFlags::READ_ONLY) {
            return Err(FsError::ReadOnly);
        }

        let ctx = res.fs.open(&res.rel, flags)?;
        let file = OpenFile {
            fs: Arc::clone(&res.fs),
            mount: res.point,
            ctx,
            offset: 0,
            flags,
        };

        let mut fds = self.fds.lock();
        let mounted = self
            .mounts
            .lock()
            .get(&file.mount)
            .is_some_and(|m| Arc::ptr_eq(&m.fs, &file.fs));
        if !mounted {
            drop(fds);
            _ = file.fs.close(file.ctx);
            return Err(FsError::NotFound);
        }

        match fds.alloc(file) {
            Ok(fd) => Ok(fd),
            Err((file, e)) => {
                drop(fds);
                _ = file.fs.close(file.ctx);
                Err(e)
            }
        }
    }

    /// Reads from the descriptor's offset, advancing it.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut fds = self.fds.lock();
        let file = fds.get_mut(fd)?;
        if !file.flags.readable() {
            return Err(FsError::BadDescriptor);
        }

        let read = file.fs.read(&mut file.ctx, file.offset, buf)?;
        file.offset += read as u64;
        Ok(read)
    }

    /// Writes at the descriptor's offset (or the end with `APPEND`), advancing it.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let mut fds = self.fds.lock();
        let file = fds.get_mut(fd)?;
        if !file.flags.writable() {
            return Err(FsError::BadDescriptor);
        }

        if file.flags.contains(OpenFlags::APPEND) {
            file.offset = file.fs.size(&file.ctx)?;
        }

        let written = file.fs.write(&mut file.ctx, file.offset, buf)?;
        file.offset += written as u64;
        Ok(written)
    }

    /// Moves the descriptor's offset, returning the new one.
    pub fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> Result<u64, FsError> {
        let mut fds = self.fds.lock();
        let file = fds.get_mut(fd)?;

        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.offset,
            Whence::End => file.fs.size(&file.ctx)?,
        };

        let new = base.checked_add_signed(offset).ok_or(FsError::InvalidParam)?;
        file.offset = new;
        Ok(new)
    }

    pub fn close(&self, fd: Fd) -> Result<(), FsError> {
        let file = self.fds.lock().take(fd)?;
        file.fs.close(file.ctx)
    }

    /// Returns the `index`th entry of an open directory.
    pub fn readdir(&self, fd: Fd, index: usize) -> Result<Option<DirEntry>, FsError> {
        let mut fds = self.fds.lock();
        let file = fds.get_mut(fd)?;
        file.fs.readdir(&mut file.ctx, index)
    }

    /// Collects every entry of the directory at `path`.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let fd = self.open(path, OpenFlags::RDONLY)?;
        let mut entries = Vec::new();

        let res = loop {
            match self.readdir(fd, entries.len()) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.close(fd)?;
        res.map(|_| entries)
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let res = self.resolve_writable(path)?;
        if res.rel == "/" {
            return Err(FsError::Busy);
        }
        res.fs.unlink(&res.rel)
    }

    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let res = self.resolve_writable(path)?;
        if res.rel == "/" {
            return Err(FsError::FileExists);
        }
        res.fs.mkdir(&res.rel)
    }

    pub fn stat(&self, path: &str) -> Result<Stat, FsError> {
        let res = self.resolve(path)?;
        let mut stat = res.fs.stat(&res.rel)?;
        stat.read_only |= res.flags.contains(MountFlags::READ_ONLY);
        Ok(stat)
    }

    /// Syncs every mounted filesystem, returning the first error.
    pub fn sync(&self) -> Result<(), FsError> {
        let mounts: Vec<_> = self.mounts.lock().filesystems();
        let mut res = Ok(());
        for fs in mounts {
            if let Err(e) = fs.sync()
                && res.is_ok()
            {
                res = Err(e);
            }
        }
        res
    }

    /// Number of descriptors currently open.
    pub fn open_files(&self) -> usize {
        self.fds.lock().open()
    }

    fn resolve(&self, path: &str) -> Result<Resolved, FsError> {
        let path = path::normalize(path)?;
        let mounts = self.mounts.lock();
        let (mount, rel) = mounts.resolve(&path).ok_or(FsError::NotFound)?;

        Ok(Resolved {
            fs: Arc::clone(&mount.fs),
            point: mount.point.clone(),
            rel: String::from(rel),
            flags: mount.flags,
        })
    }

    fn resolve_writable(&self, path: &str) -> Result<Resolved, FsError> {
        let res = self.resolve(path)?;
        if res.flags.contains(MountFlags::READ_ONLY) {
            return Err(FsError::ReadOnly);
        }
        Ok(res)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
