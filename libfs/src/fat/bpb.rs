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
    libfs/src/fat/bpb.rs

    The boot sector's BIOS parameter block and the volume geometry derived from it
*/

use crate::{FsError, SECTOR_SIZE};

/// Value of the last two bytes of a valid boot sector.
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Canonical end of chain marker, whatever the FAT type.
pub const EOC: u32 = 0x0FFFFFFF;

const OEM_NAME: &[u8; 8] = b"MARIGOLD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Classifies a volume by its number of data clusters.
    pub fn from_clusters(count: u32) -> Self {
        if count < 4085 {
            FatType::Fat12
        } else if count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// The smallest raw entry value meaning end of chain.
    pub fn eoc_min(&self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFFFFF8,
        }
    }

    /// The end of chain value written to disk.
    pub fn eoc_max(&self) -> u32 {
        match self {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFFFFFF,
        }
    }

    /// Bytes needed to store `entries` FAT entries.
    pub fn table_bytes(&self, entries: u32) -> usize {
        let entries = entries as usize;
        match self {
            FatType::Fat12 => entries.div_ceil(2) * 3,
            FatType::Fat16 => entries * 2,
            FatType::Fat32 => entries * 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }
}

pub(super) fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(super) fn le32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

pub(super) fn put16(bytes: &mut [u8], offset: usize, val: u16) {
    bytes[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
}

pub(super) fn put32(bytes: &mut [u8], offset: usize, val: u32) {
    bytes[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

/// The fields of a boot sector this driver cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    // Only meaningful on FAT32
    pub fat_size_32: u32,
    pub root_cluster: u32,
    pub fs_info: u16,
    pub backup_boot: u16,
    // Extended boot record
    pub volume_id: u32,
    pub label: [u8; 11],
}

impl BootSector {
    /// Reads a boot sector, checking it's signature.
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self, FsError> {
        if le16(sector, 510) != BOOT_SIGNATURE {
            return Err(FsError::CorruptFilesystem);
        }

        let mut bpb = BootSector {
            bytes_per_sector: le16(sector, 11),
            sectors_per_cluster: sector[13],
            reserved_sectors: le16(sector, 14),
            num_fats: sector[16],
            root_entries: le16(sector, 17),
            total_sectors_16: le16(sector, 19),
            media: sector[21],
            fat_size_16: le16(sector, 22),
            sectors_per_track: le16(sector, 24),
            heads: le16(sector, 26),
            hidden_sectors: le32(sector, 28),
            total_sectors_32: le32(sector, 32),
            fat_size_32: 0,
            root_cluster: 0,
            fs_info: 0,
            backup_boot: 0,
            volume_id: 0,
            label: [b' '; 11],
        };

        let ebr = if bpb.fat_size_16 == 0 {
            bpb.fat_size_32 = le32(sector, 36);
            bpb.root_cluster = le32(sector, 44);
            bpb.fs_info = le16(sector, 48);
            bpb.backup_boot = le16(sector, 50);
            64
        } else {
            36
        };

        // 0x29 means the volume id and label are present
        if sector[ebr + 2] == 0x29 {
            bpb.volume_id = le32(sector, ebr + 3);
            bpb.label.copy_from_slice(&sector[ebr + 7..ebr + 18]);
        }

        Ok(bpb)
    }

    /// Writes the boot sector, including the jump, OEM name and signature.
    pub fn write(&self, sector: &mut [u8; SECTOR_SIZE]) {
        sector.fill(0);
        sector[..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        sector[3..11].copy_from_slice(OEM_NAME);

        put16(sector, 11, self.bytes_per_sector);
        sector[13] = self.sectors_per_cluster;
        put16(sector, 14, self.reserved_sectors);
        sector[16] = self.num_fats;
        put16(sector, 17, self.root_entries);
        put16(sector, 19, self.total_sectors_16);
        sector[21] = self.media;
        put16(sector, 22, self.fat_size_16);
        put16(sector, 24, self.sectors_per_track);
        put16(sector, 26, self.heads);
        put32(sector, 28, self.hidden_sectors);
        put32(sector, 32, self.total_sectors_32);

        let (ebr, fs_type): (usize, &[u8; 8]) = if self.fat_size_16 == 0 {
            put32(sector, 36, self.fat_size_32);
            put32(sector, 44, self.root_cluster);
            put16(sector, 48, self.fs_info);
            put16(sector, 50, self.backup_boot);
            (64, b"FAT32   ")
        } else {
            (36, b"FAT     ")
        };

        sector[ebr] = 0x80;
        sector[ebr + 2] = 0x29;
        put32(sector, ebr + 3, self.volume_id);
        sector[ebr + 7..ebr + 18].copy_from_slice(&self.label);
        sector[ebr + 18..ebr + 26].copy_from_slice(fs_type);
        put16(sector, 510, BOOT_SIGNATURE);
    }

    pub fn total_sectors(&self) -> u32 {
        match self.total_sectors_16 {
            0 => self.total_sectors_32,
            n => n as u32,
        }
    }

    pub fn fat_size(&self) -> u32 {
        match self.fat_size_16 {
            0 => self.fat_size_32,
            n => n as u32,
        }
    }
}

/// Where everything lives on a FAT volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub fat_type: FatType,
    pub sectors_per_cluster: u32,
    pub cluster_size: usize,
    pub num_fats: u32,
    /// Sectors in each copy of the FAT.
    pub fat_size: u32,
    pub fat_start: u64,
    /// First sector of the fixed root directory, unused on FAT32.
    pub root_dir_start: u64,
    pub root_dir_sectors: u32,
    pub root_entries: u32,
    /// First cluster of the root directory on FAT32, otherwise 0.
    pub root_cluster: u32,
    pub first_data_sector: u64,
    pub cluster_count: u32,
    pub total_sectors: u64,
}

impl Geometry {
    pub fn new(bpb: &BootSector) -> Result<Self, FsError> {
        if bpb.bytes_per_sector as usize != SECTOR_SIZE {
            return Err(FsError::NotSupported);
        }

        let spc = bpb.sectors_per_cluster as u32;
        let fat_size = bpb.fat_size();
        let total = bpb.total_sectors();
        if !spc.is_power_of_two() || bpb.reserved_sectors == 0 || bpb.num_fats == 0 || fat_size == 0 || total == 0 {
            return Err(FsError::CorruptFilesystem);
        }

        let root_dir_sectors = (bpb.root_entries as u32 * 32).div_ceil(SECTOR_SIZE as u32);
        let fat_start = bpb.reserved_sectors as u32;
        // Every field here came off the disk
        let (root_dir_start, first_data_sector) = (bpb.num_fats as u32)
            .checked_mul(fat_size)
            .and_then(|fats| fats.checked_add(fat_start))
            .and_then(|root| Some((root, root.checked_add(root_dir_sectors)?)))
            .ok_or(FsError::CorruptFilesystem)?;
        if first_data_sector >= total {
            return Err(FsError::CorruptFilesystem);
        }

        let cluster_count = (total - first_data_sector) / spc;
        let fat_type = FatType::from_clusters(cluster_count);
        let entries = cluster_count.checked_add(2).ok_or(FsError::CorruptFilesystem)?;
        if cluster_count == 0 || fat_type.table_bytes(entries) > fat_size as usize * SECTOR_SIZE {
            return Err(FsError::CorruptFilesystem);
        }

        let root_cluster = match fat_type {
            FatType::Fat32 if bpb.root_entries != 0 => return Err(FsError::CorruptFilesystem),
            FatType::Fat32 if bpb.root_cluster < 2 || bpb.root_cluster > cluster_count + 1 => {
                return Err(FsError::CorruptFilesystem);
            }
            FatType::Fat32 => bpb.root_cluster,
            _ if bpb.root_entries == 0 => return Err(FsError::CorruptFilesystem),
            _ => 0,
        };

        Ok(Geometry {
            fat_type,
            sectors_per_cluster: spc,
            cluster_size: spc as usize * SECTOR_SIZE,
            num_fats: bpb.num_fats as u32,
            fat_size,
            fat_start: fat_start as u64,
            root_dir_start: root_dir_start as u64,
            root_dir_sectors,
            root_entries: bpb.root_entries as u32,
            root_cluster,
            first_data_sector: first_data_sector as u64,
            cluster_count,
            total_sectors: total as u64,
        })
    }

    /// LBA of the first sector of `cluster`.
    pub fn cluster_lba(&self, cluster: u32) -> u64 {
        self.first_data_sector + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Whether `cluster` is a data cluster on this volume.
    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.cluster_count + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 1.44 MiB floppy's boot sector.
    fn floppy() -> BootSector {
        BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            num_fats: 2,
            root_entries: 224,
            total_sectors_16: 2880,
            media: 0xF0,
            fat_size_16: 9,
            sectors_per_track: 18,
            heads: 2,
            hidden_sectors: 0,
            total_sectors_32: 0,
            fat_size_32: 0,
            root_cluster: 0,
            fs_info: 0,
            backup_boot: 0,
            volume_id: 0x1234_5678,
            label: *b"FLOPPY     ",
        }
    }

    /// Tests the derived geometry of a floppy.
    #[test]
    fn floppy_geometry() {
        let geo = Geometry::new(&floppy()).unwrap();
        assert_eq!(geo.fat_type, FatType::Fat12);
        assert_eq!(geo.root_dir_sectors, 14);
        assert_eq!(geo.root_dir_start, 19);
        assert_eq!(geo.first_data_sector, 33);
        assert_eq!(geo.cluster_count, 2847);
        assert_eq!(geo.cluster_lba(2), 33);
        assert_eq!(geo.cluster_lba(10), 41);
        assert!(geo.is_data_cluster(2848) && !geo.is_data_cluster(2849) && !geo.is_data_cluster(1))
    }

    #[test]
    #[rustfmt::skip]
    fn classifies_by_cluster_count() {
        assert_eq!( FatType::from_clusters(1),      FatType::Fat12 );
        assert_eq!( FatType::from_clusters(4084),   FatType::Fat12 );
        assert_eq!( FatType::from_clusters(4085),   FatType::Fat16 );
        assert_eq!( FatType::from_clusters(65524),  FatType::Fat16 );
        assert_eq!( FatType::from_clusters(65525),  FatType::Fat32 );
    }

    /// Tests that writing then parsing a boot sector keeps every field.
    #[test]
    fn write_then_parse() {
        let mut sector = [0; SECTOR_SIZE];
        floppy().write(&mut sector);
        assert_eq!(&sector[3..11], b"MARIGOLD");
        assert_eq!(BootSector::parse(&sector).unwrap(), floppy());

        let mut fat32 = floppy();
        fat32.fat_size_16 = 0;
        fat32.fat_size_32 = 600;
        fat32.root_cluster = 2;
        fat32.fs_info = 1;
        fat32.backup_boot = 6;
        fat32.write(&mut sector);
        assert_eq!(&sector[82..90], b"FAT32   ");
        assert_eq!(BootSector::parse(&sector).unwrap(), fat32)
    }

    /// Tests that broken boot sectors are rejected.
    #[test]
    fn rejects_bad_sectors() {
        let mut sector = [0; SECTOR_SIZE];
        assert_eq!(BootSector::parse(&sector), Err(FsError::CorruptFilesystem));

        let mut bpb = floppy();
        bpb.write(&mut sector);
        bpb.bytes_per_sector = 4096;
        assert_eq!(Geometry::new(&bpb), Err(FsError::NotSupported));

        let mut bpb = floppy();
        bpb.sectors_per_cluster = 3;
        assert_eq!(Geometry::new(&bpb), Err(FsError::CorruptFilesystem));

        let mut bpb = floppy();
        bpb.fat_size_16 = 1;
        assert_eq!(Geometry::new(&bpb), Err(FsError::CorruptFilesystem));

        let mut bpb = floppy();
        bpb.root_entries = 0;
        assert_eq!(Geometry::new(&bpb), Err(FsError::CorruptFilesystem));

        // FAT area far bigger than the volume, which overflows a u32
        let mut bpb = floppy();
        bpb.num_fats = 255;
        bpb.fat_size_16 = 0;
        bpb.fat_size_32 = 0x0200_0000;
        bpb.root_entries = 0;
        bpb.root_cluster = 2;
        bpb.total_sectors_16 = 0;
        bpb.total_sectors_32 = 100;
        bpb.write(&mut sector);
        let parsed = BootSector::parse(&sector).unwrap();
        assert_eq!(Geometry::new(&parsed), Err(FsError::CorruptFilesystem))
    }
}
