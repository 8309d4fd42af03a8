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
    libfs/src/fat/format.rs

    Creates empty FAT12/16/32 volumes
*/

use super::bpb::{BootSector, EOC, FatType, Geometry, put32};
use super::dir::{Attr, RawEntry};
use super::table::FatTable;
use crate::{BlockDevice, FsError, SECTOR_SIZE};
use alloc::{vec, vec::Vec};

const MEDIA: u8 = 0xF8;
const NUM_FATS: u8 = 2;

/// Largest request made while zeroing the disk.
const ZERO_CHUNK: usize = 128;

// FSInfo signatures
const FSINFO_LEAD: u32 = 0x41615252;
const FSINFO_STRUCT: u32 = 0x61417272;
const FSINFO_TRAIL: u32 = 0xAA550000;

#[derive(Debug, Clone)]
pub struct FormatOptions<'a> {
    pub fat_type: FatType,
    /// Written to the boot sector and as the root directory's volume label entry.
    pub label: Option<&'a str>,
    pub volume_id: u32,
}

impl FormatOptions<'_> {
    pub fn new(fat_type: FatType) -> Self {
        FormatOptions {
            fat_type,
            label: None,
            volume_id: 0x4D47_0001,
        }
    }
}

/// Formats the whole of `dev`, returning the new volume's geometry.
///
/// The smallest cluster size giving the requested FAT type is used,
/// failing with `InvalidParam` if the disk is the wrong size for it.
pub fn format(dev: &dyn BlockDevice, opts: &FormatOptions) -> Result<Geometry, FsError> {
    let kind = opts.fat_type;
    let total = u32::try_from(dev.sector_count()).map_err(|_| FsError::NotSupported)?;

    let reserved: u32 = if kind == FatType::Fat32 { 32 } else { 1 };
    let root_entries: u32 = match kind {
        FatType::Fat32 => 0,
        _ if total <= 2880 => 224,
        _ => 512,
    };
    let root_dir_sectors = (root_entries * 32).div_ceil(SECTOR_SIZE as u32);

    let (spc, fat_size) = (0..8)
        .map(|shift| 1u32 << shift)
        .find_map(|spc| {
            let data = total.checked_sub(reserved + root_dir_sectors)?;
            // sized for more clusters than will fit, which is always enough
            let fat_size = (kind.table_bytes(data / spc + 2) as u32).div_ceil(SECTOR_SIZE as u32);
            let clusters = total.checked_sub(reserved + NUM_FATS as u32 * fat_size + root_dir_sectors)? / spc;
            (clusters > 0 && FatType::from_clusters(clusters) == kind).then_some((spc, fat_size))
        })
        .ok_or(FsError::InvalidParam)?;

    let mut label = [b' '; 11];
    let name = opts.label.unwrap_or("NO NAME");
    for (dst, b) in label.iter_mut().zip(name.bytes().filter(u8::is_ascii_graphic).take(11)) {
        *dst = b.to_ascii_uppercase();
    }

    let fat32 = kind == FatType::Fat32;
    let small = !fat32 && total <= u16::MAX as u32;
    let bpb = BootSector {
        bytes_per_sector: SECTOR_SIZE as u16,
        sectors_per_cluster: spc as u8,
        reserved_sectors: reserved as u16,
        num_fats: NUM_FATS,
        root_entries: root_entries as u16,
        total_sectors_16: if small { total as u16 } else { 0 },
        media: MEDIA,
        fat_size_16: if fat32 { 0 } else { fat_size as u16 },
        sectors_per_track: 63,
        heads: 255,
        hidden_sectors: 0,
        total_sectors_32: if small { 0 } else { total },
        fat_size_32: if fat32 { fat_size } else { 0 },
        root_cluster: if fat32 { 2 } else { 0 },
        fs_info: if fat32 { 1 } else { 0 },
        backup_boot: if fat32 { 6 } else { 0 },
        volume_id: opts.volume_id,
        label,
    };
    let geo = Geometry::new(&bpb)?;

    // Everything before the data region, plus the root cluster on FAT32
    let zeroed = geo.first_data_sector + if fat32 { spc as u64 } else { 0 };
    let zeros = vec![0; ZERO_CHUNK * SECTOR_SIZE];
    let mut lba = 0;
    while lba < zeroed {
        let n = (zeroed - lba).min(ZERO_CHUNK as u64) as usize;
        dev.write(lba, &zeros[..n * SECTOR_SIZE])?;
        lba += n as u64;
    }

    let mut sector = [0; SECTOR_SIZE];
    bpb.write(&mut sector);
    dev.write(0, &sector)?;

    if fat32 {
        dev.write(6, &sector)?;
        let info = fs_info();
        dev.write(1, &info)?;
        dev.write(7, &info)?;
    }

    let mut table = FatTable::blank(kind, fat_size, geo.cluster_count + 2);
    table.set(0, 0x0FFFFF00 | MEDIA as u32)?;
    table.set(1, EOC)?;
    if fat32 {
        table.set(geo.root_cluster, EOC)?;
    }
    for copy in 0..geo.num_fats {
        dev.write(geo.fat_start + (copy * fat_size) as u64, table.bytes())?;
    }

    if opts.label.is_some() {
        let root = match kind {
            FatType::Fat32 => geo.cluster_lba(geo.root_cluster),
            _ => geo.root_dir_start,
        };
        sector.fill(0);
        sector[..32].copy_from_slice(&RawEntry::new(&label, Attr::VOLUME_ID, 0, 0).0);
        dev.write(root, &sector)?;
    }

    dev.flush()?;
    Ok(geo)
}

/// The FAT32 FSInfo sector, with the free count and next free hint left unknown.
fn fs_info() -> Vec<u8> {
    let mut info = vec![0; SECTOR_SIZE];
    put32(&mut info, 0, FSINFO_LEAD);
    put32(&mut info, 484, FSINFO_STRUCT);
    put32(&mut info, 488, u32::MAX);
    put32(&mut info, 492, u32::MAX);
    put32(&mut info, 508, FSINFO_TRAIL);
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemDisk;
    use crate::fat::bpb::{le16, le32};

    fn sector(disk: &MemDisk, lba: u64) -> [u8; SECTOR_SIZE] {
        let mut buf = [0; SECTOR_SIZE];
        disk.read(lba, &mut buf).unwrap();
        buf
    }

    #[test]
    #[rustfmt::skip]
    fn picks_geometry() {
        let geo = |sectors, kind| format(&MemDisk::new(sectors), &FormatOptions::new(kind)).unwrap();

        let fat12 = geo(2880, FatType::Fat12);
        assert_eq!( (fat12.fat_type, fat12.sectors_per_cluster, fat12.root_entries, fat12.fat_size), (FatType::Fat12, 1, 224, 9) );

        let fat16 = geo(8192, FatType::Fat16);
        assert_eq!( (fat16.fat_type, fat16.sectors_per_cluster, fat16.root_entries, fat16.fat_size), (FatType::Fat16, 1, 512, 32) );

        let fat12_big = geo(8192, FatType::Fat12);
        assert_eq!( (fat12_big.fat_type, fat12_big.sectors_per_cluster), (FatType::Fat12, 2) );

        let fat32 = geo(70000, FatType::Fat32);
        assert_eq!( (fat32.fat_type, fat32.sectors_per_cluster, fat32.root_cluster), (FatType::Fat32, 1, 2) );
    }

    /// Tests that disks too small for a type are refused.
    #[test]
    fn wrong_size() {
        let opts = FormatOptions::new(FatType::Fat32);
        assert_eq!(format(&MemDisk::new(8192), &opts), Err(FsError::InvalidParam));
        let opts = FormatOptions::new(FatType::Fat16);
        assert_eq!(format(&MemDisk::new(2880), &opts), Err(FsError::InvalidParam))
    }

    /// Tests the reserved FAT entries and FAT32's extra sectors.
    #[test]
    fn fat32_layout() {
        let disk = MemDisk::new(70000);
        let geo = format(&disk, &FormatOptions::new(FatType::Fat32)).unwrap();

        let boot = sector(&disk, 0);
        assert_eq!(&boot[..3], [0xEB, 0x3C, 0x90]);
        assert_eq!(le16(&boot, 510), 0xAA55);
        assert_eq!(sector(&disk, 6), boot);

        let info = sector(&disk, 1);
        assert_eq!((le32(&info, 0), le32(&info, 484), le32(&info, 508)), (FSINFO_LEAD, FSINFO_STRUCT, FSINFO_TRAIL));

        for copy in 0..2 {
            let fat = sector(&disk, geo.fat_start + copy * geo.fat_size as u64);
            assert_eq!((le32(&fat, 0), le32(&fat, 4), le32(&fat, 8)), (0x0FFFFFF8, 0x0FFFFFFF, 0x0FFFFFFF));
        }
    }

    /// Tests that the label ends up in the boot sector and root directory.
    #[test]
    fn writes_label() {
        let disk = MemDisk::new(2880);
        let opts = FormatOptions {
            label: Some("marigold"),
            ..FormatOptions::new(FatType::Fat12)
        };
        let geo = format(&disk, &opts).unwrap();

        assert_eq!(&sector(&disk, 0)[43..54], b"MARIGOLD   ");
        let root = sector(&disk, geo.root_dir_start);
        assert_eq!(&root[..11], b"MARIGOLD   ");
        assert_eq!(root[11], Attr::VOLUME_ID.bits());

        let fat = sector(&disk, geo.fat_start);
        assert_eq!(&fat[..3], [0xF8, 0xFF, 0xFF])
    }
}
