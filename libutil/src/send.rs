/* ---------------------------------------------------------------------------
    Sunflower kernel - sunflowerkernel.org
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
    libutil/src/send.rs

    Types for handing tables to the CPU.
*/

use crate::InitError;
use core::{fmt::Display, ptr};

/// The operand of `lgdt` / `lidt`, a limit followed by the table's address.
#[repr(C, packed)]
pub struct TableDescriptor<T> {
    limit: u16,
    offset: *const T,
}

impl<T> TableDescriptor<T> {
    /// Creates a new descriptor pointing to `table`.
    pub fn new(table: &'static T) -> Self {
        TableDescriptor {
            limit: (size_of::<T>() - 1) as u16,
            offset: table,
        }
    }

    /// Returns an invalid descriptor, used for comparing against what `sgdt` / `sidt` stored.
    pub fn invalid() -> Self {
        TableDescriptor {
            limit: 0,
            offset: ptr::null(),
        }
    }

    /// The last valid byte offset into the table.
    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// Address of the table.
    pub fn address(&self) -> u64 {
        self.offset as u64
    }
}

impl<T> PartialEq for TableDescriptor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.limit() == other.limit() && self.address() == other.address()
    }
}

impl<T> Display for TableDescriptor<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "limit = {} & offset = 0x{:x}", self.limit(), self.address())
    }
}

/// A wrapper type for easily checking if your register (`T`) loaded correctly.
pub enum LoadRegisterError<T> {
    Load(InitError<T>),
    Store(&'static str),
    Other(&'static str),
}

impl<T> From<InitError<T>> for LoadRegisterError<T> {
    fn from(err: InitError<T>) -> Self {
        LoadRegisterError::Load(err)
    }
}

impl<T> Display for LoadRegisterError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadRegisterError::Load(e) => write!(f, "Failed load, {e}"),
            LoadRegisterError::Store(t) => write!(f, "Stored {t} doesn't match loaded {t}"),
            LoadRegisterError::Other(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TABLE: [u64; 7] = [0; 7];

    /// Tests that descriptors are the exact layout `lgdt` expects.
    #[test]
    fn descriptor_layout() {
        assert_eq!(size_of::<TableDescriptor<[u64; 7]>>(), 10);
        let desc = TableDescriptor::new(&TABLE);
        assert_eq!(desc.limit(), 7 * 8 - 1);
        assert_eq!(desc.address(), &raw const TABLE as u64);
        assert!(desc != TableDescriptor::invalid())
    }
}
