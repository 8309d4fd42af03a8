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
    libfs/src/vfs/mount.rs

    Table of mounted filesystems
*/

use super::{FileSystem, MountFlags};
use crate::{FsError, path};
use alloc::{string::String, sync::Arc, vec::Vec};

pub(super) struct Mount {
    pub point: String,
    pub fs_name: String,
    pub device: String,
    pub flags: MountFlags,
    pub fs: Arc<dyn FileSystem>,
}

/// Describes a mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub point: String,
    pub fs_name: String,
    pub device: String,
    pub flags: MountFlags,
}

pub(super) struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub const fn new() -> Self {
        MountTable { mounts: Vec::new() }
    }

    /// Adds a mount, failing if the point is already taken.
    pub fn insert(&mut self, mount: Mount) -> Result<(), FsError> {
        if self.get(&mount.point).is_some() {
            return Err(FsError::FileExists);
        }
        self.mounts.push(mount);
        Ok(())
    }

    pub fn remove(&mut self, point: &str) -> Option<Mount> {
        let idx = self.mounts.iter().position(|m| m.point == point)?;
        Some(self.mounts.remove(idx))
    }

    pub fn get(&self, point: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.point == point)
    }

    /// Finds the mount with the longest point which `path` lives under,
    /// and the remainder of `path` relative to it.
    pub fn resolve<'p>(&self, path: &'p str) -> Option<(&Mount, &'p str)> {
        self.mounts
            .iter()
            .filter_map(|m| Some((m, path::strip_mount(path, &m.point)?)))
            .max_by_key(|(m, _)| m.point.len())
    }

    pub fn uses_driver(&self, name: &str) -> bool {
        self.mounts.iter().any(|m| m.fs_name == name)
    }

    pub fn filesystems(&self) -> Vec<Arc<dyn FileSystem>> {
        self.mounts.iter().map(|m| Arc::clone(&m.fs)).collect()
    }

    pub fn list(&self) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .map(|m| MountInfo {
                point: m.point.clone(),
                fs_name: m.fs_name.clone(),
                device: m.device.clone(),
                flags: m.flags,
            })
            .collect()
    }
}
