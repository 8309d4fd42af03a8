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
    libfs/src/fat/dir.rs

    On-disk directory entries and 8.3 short names
*/

use super::bpb::{le16, le32, put16, put32};
use alloc::string::String;
use bitflags::bitflags;

pub const ENTRY_SIZE: usize = 32;
pub const ENTRIES_PER_SECTOR: usize = crate::SECTOR_SIZE / ENTRY_SIZE;

/// First byte of a deleted entry.
pub const DELETED: u8 = 0xE5;

/// First byte of the entry after the last one in use.
pub const END: u8 = 0x00;

/// Attribute byte of a long name entry.
pub const LONG_NAME: u8 = 0x0F;

/// 1980-01-01, used for every date field.
const DATE: u16 = 0x0021;

/// Characters which can't appear in a short name.
const INVALID: &[u8] = b"\"*+,./:;<=>?[\\]|";

// Case flags in the reserved byte, written by some other implementations
const LOWER_BASE: u8 = 0x08;
const LOWER_EXT: u8 = 0x10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attr: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// A directory, either FAT12/16's fixed root or a cluster chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRef {
    FixedRoot,
    Chain(u32),
}

/// A raw 32 byte directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEntry(pub [u8; ENTRY_SIZE]);

impl RawEntry {
    /// Creates an 8.3 entry.
    pub fn new(short: &[u8; 11], attr: Attr, cluster: u32, size: u32) -> Self {
        let mut entry = RawEntry([0; ENTRY_SIZE]);
        entry.0[..11].copy_from_slice(short);
        entry.0[11] = attr.bits();
        for offset in [16, 18, 24] {
            put16(&mut entry.0, offset, DATE);
        }
        entry.set_cluster(cluster);
        entry.set_size(size);
        entry
    }

    pub fn short_name(&self) -> &[u8; 11] {
        self.0.first_chunk().unwrap_or(&[b' '; 11])
    }

    pub fn attr(&self) -> Attr {
        Attr::from_bits_truncate(self.0[11])
    }

    pub fn is_end(&self) -> bool {
        self.0[0] == END
    }

    pub fn is_deleted(&self) -> bool {
        self.0[0] == DELETED
    }

    pub fn is_long_name(&self) -> bool {
        self.0[11] & 0x3F == LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.attr().contains(Attr::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attr().contains(Attr::VOLUME_ID)
    }

    /// Whether this is a directory's `.` or `..` entry.
    pub fn is_dot(&self) -> bool {
        matches!(self.short_name(), b".          " | b"..         ")
    }

    pub fn cluster(&self) -> u32 {
        (le16(&self.0, 20) as u32) << 16 | le16(&self.0, 26) as u32
    }

    pub fn set_cluster(&mut self, cluster: u32) {
        put16(&mut self.0, 20, (cluster >> 16) as u16);
        put16(&mut self.0, 26, cluster as u16);
    }

    pub fn size(&self) -> u32 {
        le32(&self.0, 28)
    }

    pub fn set_size(&mut self, size: u32) {
        put32(&mut self.0, 28, size);
    }

    pub fn mark_deleted(&mut self) {
        self.0[0] = DELETED;
    }

    /// The 8.3 name as it would be shown, like `README.TXT`.
    pub fn display_name(&self) -> String {
        let short = self.short_name();
        let case = self.0[12];
        let mut name = String::new();

        for (i, &b) in short[..8].iter().enumerate() {
            // 0x05 stands in for a leading 0xE5
            let b = if i == 0 && b == 0x05 { DELETED } else { b };
            name.push(fold_case(b, case & LOWER_BASE != 0));
        }
        name.truncate(name.trim_end_matches(' ').len());

        let ext = &short[8..];
        if ext.iter().any(|&b| b != b' ') {
            name.push('.');
            for &b in ext {
                name.push(fold_case(b, case & LOWER_EXT != 0));
            }
            name.truncate(name.trim_end_matches(' ').len());
        }
        name
    }
}

fn fold_case(b: u8, lower: bool) -> char {
    if lower { b.to_ascii_lowercase() as char } else { b as char }
}

/// Generates the 8.3 name for `name`.
///
/// Characters which can't be stored are skipped and each part is truncated,
/// falling back to `NO_NAME` if nothing is left of the base.
pub fn short_name(name: &str) -> [u8; 11] {
    let mut short = [b' '; 11];
    let (base, ext) = match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => (&name[..dot], &name[dot + 1..]),
    };

    let valid = |c: &char| c.is_ascii_graphic() && !INVALID.contains(&(*c as u8));
    for (dst, c) in short[..8].iter_mut().zip(base.chars().filter(valid)) {
        *dst = c.to_ascii_uppercase() as u8;
    }
    for (dst, c) in short[8..].iter_mut().zip(ext.chars().filter(valid)) {
        *dst = c.to_ascii_uppercase() as u8;
    }

    if short[0] == b' ' {
        short[..8].copy_from_slice(b"NO_NAME ");
    }
    short
}

/// Whether `name` has to be stored with long name entries.
pub fn needs_long_name(name: &str, short: &[u8; 11]) -> bool {
    RawEntry::new(short, Attr::empty(), 0, 0).display_name() != name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn short_names() {
        assert_eq!( &short_name("hello.txt"),           b"HELLO   TXT" );
        assert_eq!( &short_name("README.TXT"),          b"README  TXT" );
        assert_eq!( &short_name("a long file.text"),    b"ALONGFILTEX" );
        assert_eq!( &short_name("archive.tar.gz"),      b"ARCHIVETGZ " );
        assert_eq!( &short_name(".profile"),            b"PROFILE    " );
        assert_eq!( &short_name("Makefile"),            b"MAKEFILE   " );
        assert_eq!( &short_name("日本.txt"),             b"NO_NAME TXT" );
    }

    #[test]
    #[rustfmt::skip]
    fn display_names() {
        let name = |short: &[u8; 11], case: u8| {
            let mut entry = RawEntry::new(short, Attr::ARCHIVE, 0, 0);
            entry.0[12] = case;
            entry.display_name()
        };

        assert_eq!( name(b"README  TXT", 0),                       "README.TXT" );
        assert_eq!( name(b"MAKEFILE   ", 0),                       "MAKEFILE"   );
        assert_eq!( name(b"HELLO   TXT", LOWER_BASE | LOWER_EXT),  "hello.txt"  );
        assert_eq!( name(b"HELLO   TXT", LOWER_EXT),               "HELLO.txt"  );
        assert_eq!( name(b"\x05BC     TXT", 0),                    "\u{e5}BC.TXT" );
    }

    /// Tests the fields of a freshly created entry.
    #[test]
    fn entry_fields() {
        let mut entry = RawEntry::new(b"KERNEL  BIN", Attr::ARCHIVE | Attr::READ_ONLY, 0x0012_3456, 4096);
        assert_eq!(entry.cluster(), 0x0012_3456);
        assert_eq!((le16(&entry.0, 20), le16(&entry.0, 26)), (0x0012, 0x3456));
        assert_eq!(entry.size(), 4096);
        assert_eq!(entry.attr(), Attr::ARCHIVE | Attr::READ_ONLY);
        assert!(!entry.is_dir() && !entry.is_long_name() && !entry.is_deleted());

        entry.mark_deleted();
        assert!(entry.is_deleted() && !entry.is_end());
        assert!(RawEntry([0; ENTRY_SIZE]).is_end())
    }

    #[test]
    fn long_names_only_when_needed() {
        assert!(!needs_long_name("README.TXT", &short_name("README.TXT")));
        assert!(needs_long_name("readme.txt", &short_name("readme.txt")));
        assert!(needs_long_name("a long file.text", &short_name("a long file.text")))
    }
}
