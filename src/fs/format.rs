//! Create an empty FAT16 or FAT32 volume on a block device.

use byteorder::{ByteOrder, LittleEndian};
use chrono::Local;
use log::info;

use super::bootrecord::{FatType, FAT16_MIN_CLUSTERS, FAT32_MAX_CLUSTERS, FAT32_MIN_CLUSTERS};
use super::fat::FsInfo;
use crate::config::FormatOptions;
use crate::device::BlockDevice;
use crate::error::{FatError, Result};

const ZERO_CHUNK: usize = 256 * 1024;
const FAT32_RESERVED_SECTORS: u32 = 32;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FSINFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;

/// Geometry derived from the device size and the options.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    total_sectors: u32,
    reserved_sectors: u32,
    sectors_per_fat: u32,
    root_entries: u16,
    root_dir_sectors: u32,
    clusters: u32,
}

impl Layout {
    fn first_fat_sector(&self) -> u64 {
        self.reserved_sectors as u64
    }

    fn root_region_sector(&self, num_fats: u8) -> u64 {
        self.first_fat_sector() + num_fats as u64 * self.sectors_per_fat as u64
    }

    fn first_data_sector(&self, num_fats: u8) -> u64 {
        self.root_region_sector(num_fats) + self.root_dir_sectors as u64
    }
}

fn invalid(msg: impl Into<String>) -> FatError {
    FatError::InvalidArgs(msg.into())
}

/// Sectors needed for one FAT copy.
fn compute_fat_sectors(
    total_sectors: u32,
    reserved: u32,
    num_fats: u32,
    root_dir_sectors: u32,
    sectors_per_cluster: u32,
    entry_size: u64,
    bytes_per_sector: u16,
) -> u32 {
    let avail = total_sectors.saturating_sub(reserved + root_dir_sectors) as u64;
    let bps = bytes_per_sector as u64;
    let spc = sectors_per_cluster as u64;
    let n = num_fats as u64;
    // ceil(entry * (avail + 2*spc) / (bps*spc + entry*n))
    let num = entry_size * (avail + 2 * spc);
    let den = bps * spc + entry_size * n;
    num.div_ceil(den) as u32
}

fn plan(device_size: u64, opts: &FormatOptions) -> Result<Layout> {
    let bps = opts.bytes_per_sector;
    if !matches!(bps, 512 | 1024 | 2048 | 4096) {
        return Err(invalid(format!("invalid bytes per sector: {bps}")));
    }
    let spc = opts.sectors_per_cluster;
    if spc == 0 || !spc.is_power_of_two() {
        return Err(invalid(format!("invalid sectors per cluster: {spc}")));
    }
    if opts.num_fats == 0 {
        return Err(invalid("at least one FAT is required"));
    }
    let total_sectors = u32::try_from(device_size / bps as u64)
        .map_err(|_| invalid(format!("device of {device_size} bytes is too large")))?;

    let (reserved_sectors, root_entries) = match opts.fat_type {
        FatType::Fat16 => {
            if opts.root_entries == 0 {
                return Err(invalid("FAT16 needs a root directory"));
            }
            let per_sector = bps / 32;
            let rounded = opts.root_entries.div_ceil(per_sector) as u32 * per_sector as u32;
            let rounded = u16::try_from(rounded)
                .map_err(|_| invalid(format!("too many root entries: {}", opts.root_entries)))?;
            (1, rounded)
        }
        FatType::Fat32 => (FAT32_RESERVED_SECTORS, 0),
    };
    let root_dir_sectors = (root_entries as u32 * 32).div_ceil(bps as u32);

    let sectors_per_fat = compute_fat_sectors(
        total_sectors,
        reserved_sectors,
        opts.num_fats as u32,
        root_dir_sectors,
        spc as u32,
        opts.fat_type.entry_size(),
        bps,
    );
    let metadata = reserved_sectors as u64
        + opts.num_fats as u64 * sectors_per_fat as u64
        + root_dir_sectors as u64;
    if metadata >= total_sectors as u64 {
        return Err(invalid(format!(
            "device of {device_size} bytes is too small for a {} volume",
            opts.fat_type.name()
        )));
    }
    let clusters = (total_sectors as u64 - metadata) / spc as u64;

    match opts.fat_type {
        FatType::Fat16 if clusters < FAT16_MIN_CLUSTERS as u64 || clusters >= FAT32_MIN_CLUSTERS as u64 => {
            return Err(invalid(format!(
                "{clusters} clusters is outside the FAT16 range, choose another cluster size"
            )));
        }
        FatType::Fat32 if clusters < FAT16_MIN_CLUSTERS as u64 || clusters > FAT32_MAX_CLUSTERS => {
            return Err(invalid(format!("{clusters} clusters cannot hold a FAT32 volume")));
        }
        _ => {}
    }

    Ok(Layout {
        total_sectors,
        reserved_sectors,
        sectors_per_fat,
        root_entries,
        root_dir_sectors,
        clusters: clusters as u32,
    })
}

fn label_bytes(label: &str) -> Result<[u8; 11]> {
    if label.len() > 11 || !label.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(invalid(format!("invalid volume label: {label:?}")));
    }
    let mut out = [b' '; 11];
    for (slot, b) in out.iter_mut().zip(label.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    Ok(out)
}

fn volume_serial() -> u32 {
    let now = Local::now();
    (now.timestamp() as u32) ^ now.timestamp_subsec_nanos().rotate_left(16)
}

fn boot_sector(opts: &FormatOptions, layout: &Layout) -> Result<Vec<u8>> {
    let bps = opts.bytes_per_sector;
    let mut bpb = vec![0u8; bps as usize];
    let is_fat32 = opts.fat_type == FatType::Fat32;

    let jump: [u8; 3] = if is_fat32 { [0xEB, 0x58, 0x90] } else { [0xEB, 0x3C, 0x90] };
    bpb[0..3].copy_from_slice(&jump);
    bpb[3..11].copy_from_slice(b"RUSTYFAT");
    LittleEndian::write_u16(&mut bpb[11..13], bps);
    bpb[13] = opts.sectors_per_cluster;
    LittleEndian::write_u16(&mut bpb[14..16], layout.reserved_sectors as u16);
    bpb[16] = opts.num_fats;
    LittleEndian::write_u16(&mut bpb[17..19], layout.root_entries);
    // The 16-bit count is only used by FAT16 volumes small enough for it.
    if !is_fat32 && layout.total_sectors <= u16::MAX as u32 {
        LittleEndian::write_u16(&mut bpb[19..21], layout.total_sectors as u16);
    } else {
        LittleEndian::write_u32(&mut bpb[32..36], layout.total_sectors);
    }
    bpb[21] = 0xF8;
    LittleEndian::write_u16(&mut bpb[24..26], 63);
    LittleEndian::write_u16(&mut bpb[26..28], 255);

    let ext = if is_fat32 {
        LittleEndian::write_u32(&mut bpb[36..40], layout.sectors_per_fat);
        // Flags 0: every FAT copy is mirrored.
        LittleEndian::write_u16(&mut bpb[40..42], 0);
        LittleEndian::write_u32(&mut bpb[44..48], FAT32_ROOT_CLUSTER);
        LittleEndian::write_u16(&mut bpb[48..50], FSINFO_SECTOR);
        LittleEndian::write_u16(&mut bpb[50..52], BACKUP_BOOT_SECTOR);
        64
    } else {
        let spf = u16::try_from(layout.sectors_per_fat)
            .map_err(|_| invalid("FAT16 table does not fit a 16-bit sector count"))?;
        LittleEndian::write_u16(&mut bpb[22..24], spf);
        36
    };
    bpb[ext] = 0x80;
    // Bit 0 of the flags byte set: cleanly unmounted.
    bpb[ext + 1] = 0x01;
    bpb[ext + 2] = 0x29;
    LittleEndian::write_u32(&mut bpb[ext + 3..ext + 7], volume_serial());
    bpb[ext + 7..ext + 18].copy_from_slice(&label_bytes(&opts.label)?);
    bpb[ext + 18..ext + 26].copy_from_slice(if is_fat32 { b"FAT32   " } else { b"FAT16   " });

    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    Ok(bpb)
}

fn zero_range(dev: &dyn BlockDevice, offset: u64, len: u64) -> Result<()> {
    let zeros = vec![0u8; ZERO_CHUNK];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(ZERO_CHUNK as u64) as usize;
        dev.write_at(&zeros[..n], offset + done)?;
        done += n as u64;
    }
    Ok(())
}

/// Write an empty volume over the whole device.
pub fn format_volume(dev: &dyn BlockDevice, opts: &FormatOptions) -> Result<()> {
    let layout = plan(dev.size(), opts)?;
    let bps = opts.bytes_per_sector as u64;
    let is_fat32 = opts.fat_type == FatType::Fat32;
    let cluster_bytes = opts.sectors_per_cluster as u64 * bps;

    // Reserved area, every FAT copy and the root region or root cluster.
    let mut metadata_end = layout.first_data_sector(opts.num_fats) * bps;
    if is_fat32 {
        metadata_end += cluster_bytes;
    }
    zero_range(dev, 0, metadata_end)?;

    let boot = boot_sector(opts, &layout)?;
    dev.write_at(&boot, 0)?;

    if is_fat32 {
        let mut sector = vec![0u8; bps as usize];
        FsInfo {
            free_count: layout.clusters - 1,
            next_free: FAT32_ROOT_CLUSTER + 1,
        }
        .write_to(&mut sector);
        dev.write_at(&sector, FSINFO_SECTOR as u64 * bps)?;
        dev.write_at(&boot, BACKUP_BOOT_SECTOR as u64 * bps)?;
        dev.write_at(&sector, (BACKUP_BOOT_SECTOR + FSINFO_SECTOR) as u64 * bps)?;
    }

    // FAT[0] carries the media byte, FAT[1] the clean and no-error bits.
    let fat_type = opts.fat_type;
    let entry_size = fat_type.entry_size() as usize;
    let mut head = vec![0u8; entry_size * 3];
    let mut entries: Vec<u32> = match fat_type {
        FatType::Fat16 => vec![0xFFF8, 0xFFFF],
        FatType::Fat32 => vec![0x0FFF_FFF8, 0x0FFF_FFFF],
    };
    if is_fat32 {
        entries.push(fat_type.eof_value());
    }
    for (i, value) in entries.iter().enumerate() {
        let slot = &mut head[i * entry_size..(i + 1) * entry_size];
        match fat_type {
            FatType::Fat16 => LittleEndian::write_u16(slot, *value as u16),
            FatType::Fat32 => LittleEndian::write_u32(slot, *value),
        }
    }
    for copy in 0..opts.num_fats as u64 {
        let offset = (layout.first_fat_sector() + copy * layout.sectors_per_fat as u64) * bps;
        dev.write_at(&head[..entries.len() * entry_size], offset)?;
    }
    dev.flush()?;

    info!(
        "formatted {} volume: {} clusters of {} bytes, {} FATs of {} sectors",
        fat_type.name(),
        layout.clusters,
        cluster_bytes,
        opts.num_fats,
        layout.sectors_per_fat
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::fs::bootrecord::{Bootrecord, RootLocation};

    fn parse(dev: &MemoryDevice) -> Bootrecord {
        Bootrecord::parse(&dev.snapshot()[..512], dev.size()).unwrap()
    }

    #[test]
    fn test_fat16_layout() {
        let dev = MemoryDevice::new(16 << 20);
        let mut opts = FormatOptions::fat16(4);
        opts.label = "scratch".into();
        format_volume(&dev, &opts).unwrap();
        let boot = parse(&dev);
        assert_eq!(boot.fat_type(), FatType::Fat16);
        assert_eq!(boot.cluster_size(), 2048);
        assert_eq!(boot.sectors_per_fat(), 32);
        assert_eq!(boot.num_usable_clusters(), 8167);
        assert_eq!(boot.label(), Some("SCRATCH"));
        assert!(matches!(boot.root(), RootLocation::Region { max_entries: 512, .. }));
        assert!(boot.mirroring().active);
    }

    #[test]
    fn test_fat32_layout() {
        let dev = MemoryDevice::new(8 << 20);
        format_volume(&dev, &FormatOptions::fat32(1)).unwrap();
        let image = dev.snapshot();
        let boot = parse(&dev);
        assert_eq!(boot.fat_type(), FatType::Fat32);
        assert_eq!(boot.root_cluster(), 2);
        assert_eq!(boot.reserved_sectors(), 32);
        assert_eq!(boot.sectors_per_fat(), 126);
        assert_eq!(boot.label(), None);
        // Backup boot sector matches the primary.
        assert_eq!(image[..512], image[6 * 512..7 * 512]);
        let info = FsInfo::parse(&image[512..1024]).unwrap();
        assert_eq!(info.free_count, boot.num_usable_clusters() - 1);
        assert_eq!(info.next_free, 3);
    }

    #[test]
    fn test_fat_heads_written_to_every_copy() {
        let dev = MemoryDevice::new(8 << 20);
        format_volume(&dev, &FormatOptions::fat32(1)).unwrap();
        let image = dev.snapshot();
        let boot = parse(&dev);
        for copy in 0..2u8 {
            let at = boot.cluster_location_fat(copy, 0) as usize;
            assert_eq!(LittleEndian::read_u32(&image[at..]), 0x0FFF_FFF8);
            assert_eq!(LittleEndian::read_u32(&image[at + 4..]), 0x0FFF_FFFF);
            assert_eq!(LittleEndian::read_u32(&image[at + 8..]), 0x0FFF_FFFF);
            assert_eq!(LittleEndian::read_u32(&image[at + 12..]), 0);
        }
    }

    #[test]
    fn test_rejects_bad_geometry() {
        // 4 MiB with 2 KiB clusters is FAT12 territory.
        let dev = MemoryDevice::new(4 << 20);
        assert!(matches!(
            format_volume(&dev, &FormatOptions::fat16(4)),
            Err(FatError::InvalidArgs(_))
        ));
        let dev = MemoryDevice::new(16 << 20);
        assert!(matches!(
            format_volume(&dev, &FormatOptions::fat16(3)),
            Err(FatError::InvalidArgs(_))
        ));
        let mut opts = FormatOptions::fat32(1);
        opts.label = "much too long".into();
        assert!(matches!(format_volume(&dev, &opts), Err(FatError::InvalidArgs(_))));
        // 1 MiB of one-sector clusters would be a FAT12-sized FAT32.
        let small = MemoryDevice::new(1 << 20);
        assert!(matches!(
            format_volume(&small, &FormatOptions::fat32(1)),
            Err(FatError::InvalidArgs(_))
        ));
        let tiny = MemoryDevice::new(8 * 1024);
        assert!(format_volume(&tiny, &FormatOptions::fat32(1)).is_err());
    }
}
