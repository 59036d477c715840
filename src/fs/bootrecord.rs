//! Boot sector (BPB) parsing and the volume geometry derived from it.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{FatError, Result};

/// Size of the boot sector as read at mount.
pub const BOOT_SECTOR_SIZE: usize = 512;

/// Fewest clusters a FAT16 volume may have; anything below is FAT12.
pub const FAT16_MIN_CLUSTERS: u32 = 4085;
/// Fewest clusters a FAT32 volume has by the cluster-count rule.
pub const FAT32_MIN_CLUSTERS: u32 = 65525;
/// Largest cluster count a 28-bit FAT32 entry can address.
pub const FAT32_MAX_CLUSTERS: u64 = 0x0FFF_FFF5;

/// FAT variant. FAT12 volumes are recognised only to be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }

    /// Bytes per FAT entry on disk.
    pub fn entry_size(&self) -> u64 {
        match self {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }

    /// Bits of an entry that carry the cluster value.
    pub fn mask(&self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Smallest value that marks end-of-chain.
    pub fn eof_threshold(&self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// Value written to terminate a chain.
    pub fn eof_value(&self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub fn bad_value(&self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }

    pub fn is_eof(&self, entry: u32) -> bool {
        entry & self.mask() >= self.eof_threshold()
    }

    pub fn is_free(&self, entry: u32) -> bool {
        entry & self.mask() == 0
    }

    pub fn is_bad(&self, entry: u32) -> bool {
        entry & self.mask() == self.bad_value()
    }

    /// FAT[1] bit that is set while the volume is cleanly unmounted.
    pub fn clean_bit(&self) -> u32 {
        match self {
            FatType::Fat16 => 0x8000,
            FatType::Fat32 => 0x0800_0000,
        }
    }

    /// FAT[1] bit that is set while no hard I/O error has been recorded.
    pub fn no_error_bit(&self) -> u32 {
        match self {
            FatType::Fat16 => 0x4000,
            FatType::Fat32 => 0x0400_0000,
        }
    }

    /// Boot sector byte holding the volume dirty flag in bit 0.
    pub fn dirty_flag_offset(&self) -> u64 {
        match self {
            FatType::Fat16 => 0x25,
            FatType::Fat32 => 0x41,
        }
    }
}

/// How the FAT copies are kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mirroring {
    /// Writes go to every FAT copy.
    pub active: bool,
    pub num_fats: u8,
    /// The copy reads come from (and the one whose writes must succeed).
    pub primary_fat_index: u8,
}

/// Where the root directory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootLocation {
    /// FAT16 fixed root region.
    Region { offset: u64, max_entries: u16 },
    /// FAT32 root cluster chain.
    Cluster(u32),
}

/// Parsed boot sector. Immutable once the volume is mounted.
#[derive(Debug, Clone)]
pub struct Bootrecord {
    fat_type: FatType,
    total_sectors: u64,
    sector_size: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    num_fats: u8,
    sectors_per_fat: u64,
    first_data_sector: u64,
    num_usable_clusters: u32,
    mirroring: Mirroring,
    root_cluster: u32,
    fsinfo_offset: Option<u64>,
    root_region_offset: u64,
    max_root_entries: u16,
    label: Option<String>,
}

fn invalid(msg: impl Into<String>) -> FatError {
    FatError::FormatInvalid(msg.into())
}

impl Bootrecord {
    /// Parse the first sector of a volume living on a device of
    /// `device_size` bytes.
    pub fn parse(bpb: &[u8], device_size: u64) -> Result<Self> {
        if bpb.len() < BOOT_SECTOR_SIZE {
            return Err(invalid(format!("boot sector too short: {} bytes", bpb.len())));
        }
        if bpb[510] != 0x55 || bpb[511] != 0xAA {
            return Err(invalid("missing 0x55AA boot signature"));
        }
        // Jump instruction: EB xx 90 or E9 xx xx
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(invalid("bad jump instruction"));
        }

        let sector_size = LittleEndian::read_u16(&bpb[11..13]);
        if !matches!(sector_size, 512 | 1024 | 2048 | 4096) {
            return Err(invalid(format!("invalid bytes per sector: {sector_size}")));
        }
        let sector_size = sector_size as u64;

        let sectors_per_cluster = bpb[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(invalid(format!(
                "invalid sectors per cluster: {sectors_per_cluster}"
            )));
        }
        let sectors_per_cluster = sectors_per_cluster as u64;

        let reserved_sectors = LittleEndian::read_u16(&bpb[14..16]) as u64;
        if reserved_sectors == 0 {
            return Err(invalid("no reserved sectors"));
        }
        let num_fats = bpb[16];
        if num_fats == 0 {
            return Err(invalid("volume has no FAT"));
        }
        let root_entries = LittleEndian::read_u16(&bpb[17..19]);
        let total_sectors_16 = LittleEndian::read_u16(&bpb[19..21]) as u64;
        let sectors_per_fat_16 = LittleEndian::read_u16(&bpb[22..24]) as u64;
        let total_sectors_32 = LittleEndian::read_u32(&bpb[32..36]) as u64;
        let sectors_per_fat_32 = LittleEndian::read_u32(&bpb[36..40]) as u64;

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };
        if total_sectors == 0 {
            return Err(invalid("total sector count is zero"));
        }

        // A zero 16-bit FAT size together with a zero root entry count only
        // occurs in the FAT32 BPB layout. Small FAT32 images may hold fewer
        // than 65525 clusters, so above the FAT12 range the layout decides.
        let fat32_layout = sectors_per_fat_16 == 0 && root_entries == 0;
        if !fat32_layout && root_entries == 0 {
            return Err(invalid("FAT16 layout without root directory entries"));
        }
        let sectors_per_fat = if fat32_layout {
            sectors_per_fat_32
        } else {
            sectors_per_fat_16
        };
        if sectors_per_fat == 0 {
            return Err(invalid("sectors per FAT is zero"));
        }

        let root_dir_sectors = (root_entries as u64 * 32).div_ceil(sector_size);
        let first_data_sector =
            reserved_sectors + num_fats as u64 * sectors_per_fat + root_dir_sectors;
        if first_data_sector >= total_sectors {
            return Err(invalid(format!(
                "data region starts at sector {first_data_sector}, past the {total_sectors} sector volume"
            )));
        }

        let clusters = (total_sectors - first_data_sector) / sectors_per_cluster;
        if clusters == 0 {
            return Err(invalid("volume has no usable clusters"));
        }
        if clusters > FAT32_MAX_CLUSTERS {
            return Err(invalid(format!("too many clusters: {clusters}")));
        }
        let num_usable_clusters = clusters as u32;

        if device_size < total_sectors * sector_size {
            return Err(invalid(format!(
                "device holds {device_size} bytes but volume declares {}",
                total_sectors * sector_size
            )));
        }

        if num_usable_clusters < FAT16_MIN_CLUSTERS {
            return Err(invalid(format!(
                "FAT12 volumes are not supported ({num_usable_clusters} clusters)"
            )));
        }
        let fat_type = if fat32_layout {
            FatType::Fat32
        } else if num_usable_clusters < FAT32_MIN_CLUSTERS {
            FatType::Fat16
        } else {
            return Err(invalid(format!(
                "FAT16 layout with {num_usable_clusters} clusters"
            )));
        };

        let fat_bytes_needed = (num_usable_clusters as u64 + 2) * fat_type.entry_size();
        if sectors_per_fat * sector_size < fat_bytes_needed {
            return Err(invalid(format!(
                "FAT of {sectors_per_fat} sectors cannot map {num_usable_clusters} clusters"
            )));
        }

        let mut record = Self {
            fat_type,
            total_sectors,
            sector_size,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            first_data_sector,
            num_usable_clusters,
            mirroring: Mirroring {
                active: true,
                num_fats,
                primary_fat_index: 0,
            },
            root_cluster: 0,
            fsinfo_offset: None,
            root_region_offset: 0,
            max_root_entries: 0,
            label: None,
        };

        match fat_type {
            FatType::Fat16 => {
                record.root_region_offset =
                    (reserved_sectors + num_fats as u64 * sectors_per_fat) * sector_size;
                record.max_root_entries = root_entries;
                record.label = parse_label(&bpb[43..54], bpb[38]);
            }
            FatType::Fat32 => {
                // Extended flags: bit 7 disables mirroring, bits 0-3 pick
                // the single active FAT when it is disabled.
                let ext_flags = LittleEndian::read_u16(&bpb[40..42]);
                let active = ext_flags & 0x0080 == 0;
                let primary = if active { 0 } else { (ext_flags & 0x000F) as u8 };
                if primary >= num_fats {
                    return Err(invalid(format!(
                        "active FAT {primary} does not exist ({num_fats} FATs)"
                    )));
                }
                record.mirroring = Mirroring {
                    active,
                    num_fats,
                    primary_fat_index: primary,
                };

                let root_cluster = LittleEndian::read_u32(&bpb[44..48]) & FatType::Fat32.mask();
                if !record.cluster_in_valid_range(root_cluster) {
                    return Err(invalid(format!("root cluster {root_cluster} out of range")));
                }
                record.root_cluster = root_cluster;

                let fsinfo_sector = LittleEndian::read_u16(&bpb[48..50]) as u64;
                if fsinfo_sector != 0 {
                    if fsinfo_sector >= reserved_sectors {
                        return Err(invalid(format!(
                            "FSInfo sector {fsinfo_sector} outside reserved region"
                        )));
                    }
                    record.fsinfo_offset = Some(fsinfo_sector * sector_size);
                }

                let backup_sector = LittleEndian::read_u16(&bpb[50..52]) as u64;
                if backup_sector != 0 && backup_sector >= reserved_sectors {
                    return Err(invalid(format!(
                        "backup boot sector {backup_sector} outside reserved region"
                    )));
                }
                record.label = parse_label(&bpb[71..82], bpb[66]);
            }
        }

        Ok(record)
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn sectors_per_cluster(&self) -> u64 {
        self.sectors_per_cluster
    }

    pub fn cluster_size(&self) -> u64 {
        self.sectors_per_cluster * self.sector_size
    }

    pub fn reserved_sectors(&self) -> u64 {
        self.reserved_sectors
    }

    pub fn num_fats(&self) -> u8 {
        self.num_fats
    }

    pub fn sectors_per_fat(&self) -> u64 {
        self.sectors_per_fat
    }

    pub fn first_data_sector(&self) -> u64 {
        self.first_data_sector
    }

    pub fn num_usable_clusters(&self) -> u32 {
        self.num_usable_clusters
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    /// FAT32 root cluster; 0 on FAT16.
    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    pub fn fsinfo_offset(&self) -> Option<u64> {
        self.fsinfo_offset
    }

    pub fn root(&self) -> RootLocation {
        match self.fat_type {
            FatType::Fat16 => RootLocation::Region {
                offset: self.root_region_offset,
                max_entries: self.max_root_entries,
            },
            FatType::Fat32 => RootLocation::Cluster(self.root_cluster),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Bytes covered by the volume.
    pub fn volume_size(&self) -> u64 {
        self.total_sectors * self.sector_size
    }

    /// Byte offset of `cluster`'s entry in FAT copy `fat_index`.
    pub fn cluster_location_fat(&self, fat_index: u8, cluster: u32) -> u64 {
        (self.reserved_sectors + fat_index as u64 * self.sectors_per_fat) * self.sector_size
            + cluster as u64 * self.fat_type.entry_size()
    }

    /// Byte offset of the first byte of `cluster`'s data.
    pub fn cluster_location_data(&self, cluster: u32) -> u64 {
        ((cluster as u64).saturating_sub(2) * self.sectors_per_cluster + self.first_data_sector)
            * self.sector_size
    }

    pub fn cluster_in_valid_range(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster as u64 <= 2 + self.num_usable_clusters as u64
    }

    /// One past the last cluster that may be handed out.
    pub fn cluster_end(&self) -> u32 {
        self.num_usable_clusters + 2
    }
}

/// Volume label, present when the extended boot signature is 0x29.
fn parse_label(raw: &[u8], ext_signature: u8) -> Option<String> {
    if ext_signature != 0x29 {
        return None;
    }
    let label = std::str::from_utf8(raw).unwrap_or("").trim().to_string();
    if label.is_empty() || label == "NO NAME" {
        None
    } else {
        Some(label)
    }
}
