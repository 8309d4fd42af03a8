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
    libfs/src/vfs/fd.rs

    Open file descriptors
*/

use super::{FileContext, FileSystem, OpenFlags};
use crate::FsError;
use alloc::{string::String, sync::Arc};

/// How many files can be open at once.
pub const MAX_FDS: usize = 32;

/// A file descriptor, an index into the descriptor table.
pub type Fd = usize;

pub(super) struct OpenFile {
    pub fs: Arc<dyn FileSystem>,
    /// Point of the mount the file was opened through.
    pub mount: String,
    pub ctx: FileContext,
    pub offset: u64,
    pub flags: OpenFlags,
}

pub(super) struct FdTable {
    files: [Option<OpenFile>; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        FdTable {
            files: [const { None }; MAX_FDS],
        }
    }

    /// Stores `file` in the lowest free slot, handing it back if there isn't one.
    pub fn alloc(&mut self, file: OpenFile) -> Result<Fd, (OpenFile, FsError)> {
        match self.files.iter().position(Option::is_none) {
            Some(fd) => {
                self.files[fd] = Some(file);
                Ok(fd)
            }
            None => Err((file, FsError::TooManyOpenFiles)),
        }
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, FsError> {
        self.files.get_mut(fd).and_then(Option::as_mut).ok_or(FsError::BadDescriptor)
    }

    pub fn take(&mut self, fd: Fd) -> Result<OpenFile, FsError> {
        self.files.get_mut(fd).and_then(Option::take).ok_or(FsError::BadDescriptor)
    }

    /// Whether any open file was opened through the mount at `point`.
    pub fn uses_mount(&self, point: &str) -> bool {
        self.files.iter().flatten().any(|f| f.mount == point)
    }

    pub fn open(&self) -> usize {
        self.files.iter().flatten().count()
    }
}
