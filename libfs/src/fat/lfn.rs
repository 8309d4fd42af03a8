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
    libfs/src/fat/lfn.rs

    VFAT long file names, stored as runs of UCS-2 fragments before their 8.3 entry
*/

use super::bpb::{le16, put16};
use super::dir::{ENTRY_SIZE, LONG_NAME};
use crate::FsError;
use alloc::{string::String, vec::Vec};

/// Characters stored in each entry.
pub const CHARS_PER_ENTRY: usize = 13;

/// Longest name, in UCS-2 code units.
pub const MAX_NAME: usize = 255;

/// Set in the sequence number of the entry holding the end of the name.
pub const LAST_ENTRY: u8 = 0x40;

/// Where each of the 13 code units lives in an entry.
const UNIT_OFFSETS: [usize; CHARS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Checksum of an 8.3 name, stored in each of it's long name entries.
pub fn checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}

/// Converts `name` to UCS-2, failing if it's empty, too long or outside the BMP.
pub fn encode(name: &str) -> Result<Vec<u16>, FsError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_NAME || units.iter().any(|u| (0xD800..0xE000).contains(u)) {
        return Err(FsError::InvalidParam);
    }
    Ok(units)
}

/// Builds the long name entries for `name`, in the order they're stored on disk.
pub fn entries(name: &str, short: &[u8; 11]) -> Result<Vec<[u8; ENTRY_SIZE]>, FsError> {
    let units = encode(name)?;
    let count = units.len().div_ceil(CHARS_PER_ENTRY);
    let sum = checksum(short);

    let entries = (1..=count)
        .rev()
        .map(|seq| {
            let mut entry = [0; ENTRY_SIZE];
            entry[0] = seq as u8 | if seq == count { LAST_ENTRY } else { 0 };
            entry[11] = LONG_NAME;
            entry[13] = sum;

            for (i, &offset) in UNIT_OFFSETS.iter().enumerate() {
                let idx = (seq - 1) * CHARS_PER_ENTRY + i;
                let unit = match idx.cmp(&units.len()) {
                    core::cmp::Ordering::Less => units[idx],
                    core::cmp::Ordering::Equal => 0x0000,
                    core::cmp::Ordering::Greater => 0xFFFF,
                };
                put16(&mut entry, offset, unit);
            }
            entry
        })
        .collect();

    Ok(entries)
}

/// Assembles a long name from the entries read before an 8.3 entry.
#[derive(Debug, Default)]
pub struct Collector {
    units: Vec<u16>,
    checksum: u8,
    /// Sequence number of the next entry expected, 0 once the name is complete.
    next: u8,
    active: bool,
}

impl Collector {
    /// Feeds a long name entry in.
    ///
    /// Entries out of sequence or with a different checksum start over.
    pub fn push(&mut self, entry: &[u8; ENTRY_SIZE]) {
        let seq = entry[0] & !LAST_ENTRY;
        if entry[0] & LAST_ENTRY != 0 && seq != 0 && seq as usize * CHARS_PER_ENTRY <= MAX_NAME + CHARS_PER_ENTRY {
            self.units.clear();
            self.units.resize(seq as usize * CHARS_PER_ENTRY, 0xFFFF);
            self.checksum = entry[13];
            self.next = seq;
            self.active = true;
        }

        if !self.active || seq != self.next || seq == 0 || entry[13] != self.checksum {
            self.reset();
            return;
        }

        let base = (seq as usize - 1) * CHARS_PER_ENTRY;
        for (i, &offset) in UNIT_OFFSETS.iter().enumerate() {
            self.units[base + i] = le16(entry, offset);
        }
        self.next -= 1;
    }

    /// Returns the collected name if it belongs to `short`, then starts over.
    pub fn finish(&mut self, short: &[u8; 11]) -> Option<String> {
        let complete = self.active && self.next == 0 && self.checksum == checksum(short);
        let units = core::mem::take(&mut self.units);
        self.reset();

        if !complete {
            return None;
        }

        let len = units.iter().position(|&u| u == 0x0000 || u == 0xFFFF).unwrap_or(units.len());
        char::decode_utf16(units[..len].iter().copied())
            .collect::<Result<String, _>>()
            .ok()
            .filter(|name| !name.is_empty())
    }

    pub fn reset(&mut self) {
        self.units.clear();
        self.next = 0;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: &[u8; 11] = b"LONGFI~1TXT";

    fn collect(entries: &[[u8; ENTRY_SIZE]], short: &[u8; 11]) -> Option<String> {
        let mut collector = Collector::default();
        for entry in entries {
            collector.push(entry);
        }
        collector.finish(short)
    }

    #[test]
    #[rustfmt::skip]
    fn checksums() {
        assert_eq!( checksum(b"HELLO   TXT"), 0xF1 );
        assert_eq!( checksum(b"README  TXT"), 0x73 );
        assert_eq!( checksum(SHORT),          0xD4 );
    }

    /// Tests the layout of a name spanning two entries.
    #[test]
    fn entry_layout() {
        let entries = entries("a long file name.txt", SHORT).unwrap();
        assert_eq!(entries.len(), 2);

        // stored last entry first
        assert_eq!(entries[0][0], 0x42);
        assert_eq!(entries[1][0], 0x01);
        assert!(entries.iter().all(|e| e[11] == LONG_NAME && e[13] == 0xD4));

        assert_eq!(le16(&entries[1], 1), 'a' as u16);
        assert_eq!(le16(&entries[1], 30), 'n' as u16);
        assert_eq!(le16(&entries[0], 14), 'x' as u16);
        // "a long file name.txt" is 20 units, so the 21st terminates and the rest are padding
        assert_eq!(le16(&entries[0], 18), 0x0000);
        assert_eq!(le16(&entries[0], 20), 0xFFFF);
        assert_eq!(le16(&entries[0], 30), 0xFFFF)
    }

    /// Tests that names survive being split into entries and collected back.
    #[test]
    fn names_survive() {
        let long = "x".repeat(MAX_NAME);
        for name in ["a", "exactly 13 ch", "Grüße aus Köln.txt", "日本語のファイル名", long.as_str()] {
            assert_eq!(collect(&entries(name, SHORT).unwrap(), SHORT).as_deref(), Some(name));
        }
    }

    /// Tests that names which can't be stored are refused.
    #[test]
    fn rejects_bad_names() {
        assert_eq!(encode(""), Err(FsError::InvalidParam));
        assert_eq!(encode(&"x".repeat(MAX_NAME + 1)), Err(FsError::InvalidParam));
        assert_eq!(encode("emoji 🌻"), Err(FsError::InvalidParam))
    }

    /// Tests that mismatched or incomplete runs fall back to nothing.
    #[test]
    fn broken_runs() {
        let entries = entries("a long file name.txt", SHORT).unwrap();
        assert_eq!(collect(&entries, b"OTHER   TXT"), None);
        assert_eq!(collect(&entries[1..], SHORT), None);
        assert_eq!(collect(&[entries[1], entries[0]], SHORT), None);

        let mut collector = Collector::default();
        collector.push(&entries[0]);
        collector.reset();
        collector.push(&entries[1]);
        assert_eq!(collector.finish(SHORT), None)
    }
}
