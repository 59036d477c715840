//! File Allocation Table access: entry get/set, allocation, mirroring,
//! dirty/error bits and the FAT32 FSInfo hints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use super::bootrecord::{Bootrecord, FatType};
use crate::device::BlockDevice;
use crate::error::{BestEffort, FatError, Result};

/// FAT bytes read per device access while scanning.
const SCAN_CHUNK: usize = 64 * 1024;

const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG: u32 = 0xAA55_0000;
const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Decoded FSInfo hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    /// Parse a 512-byte FSInfo sector. `None` if the signatures are wrong.
    pub fn parse(sector: &[u8]) -> Option<Self> {
        if sector.len() < 512 {
            return None;
        }
        let lead = LittleEndian::read_u32(&sector[0..4]);
        let strukt = LittleEndian::read_u32(&sector[484..488]);
        let trail = LittleEndian::read_u32(&sector[508..512]);
        if lead != FSINFO_LEAD_SIG || strukt != FSINFO_STRUCT_SIG || trail != FSINFO_TRAIL_SIG {
            return None;
        }
        Some(Self {
            free_count: LittleEndian::read_u32(&sector[488..492]),
            next_free: LittleEndian::read_u32(&sector[492..496]),
        })
    }

    /// Write signatures and hints into a 512-byte sector buffer.
    pub fn write_to(&self, sector: &mut [u8]) {
        LittleEndian::write_u32(&mut sector[0..4], FSINFO_LEAD_SIG);
        LittleEndian::write_u32(&mut sector[484..488], FSINFO_STRUCT_SIG);
        LittleEndian::write_u32(&mut sector[488..492], self.free_count);
        LittleEndian::write_u32(&mut sector[492..496], self.next_free);
        LittleEndian::write_u32(&mut sector[508..512], FSINFO_TRAIL_SIG);
    }
}

struct TableState {
    closed: bool,
    fsinfo_valid: bool,
    free_count: u32,
    next_free_hint: u32,
}

/// An open File Allocation Table and its mirrors.
pub struct FatTable {
    device: Arc<dyn BlockDevice>,
    boot: Arc<Bootrecord>,
    read_only: bool,
    state: Mutex<TableState>,
    mirror_failures: AtomicU64,
}

impl FatTable {
    /// Open the table of a parsed volume.
    ///
    /// Refuses volumes that were not cleanly unmounted or that recorded a
    /// hard error, unless `force` is set. A writable open marks the volume
    /// dirty and flushes before returning.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        boot: Arc<Bootrecord>,
        read_only: bool,
        force: bool,
    ) -> Result<Self> {
        let table = Self {
            device,
            boot,
            read_only,
            state: Mutex::new(TableState {
                closed: false,
                fsinfo_valid: false,
                free_count: 0,
                next_free_hint: 2,
            }),
            mirror_failures: AtomicU64::new(0),
        };

        let was_dirty = table.is_dirty();
        if !force {
            if was_dirty {
                return Err(FatError::DirtyVolume);
            }
            if table.is_hard_error() {
                return Err(FatError::HardIoError);
            }
        }

        if !read_only {
            table.set_dirty(true)?;
            table.device.flush()?;
        }

        // A dirty volume's FSInfo free count may be stale.
        table.load_hints(!was_dirty)?;
        info!(
            "{} table opened: {} clusters, {} free{}",
            table.boot.fat_type().name(),
            table.boot.num_usable_clusters(),
            table.free_count(),
            if read_only { " (read-only)" } else { "" }
        );
        Ok(table)
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fat_type(&self) -> FatType {
        self.boot.fat_type()
    }

    /// Seed the free count and next-free hint from FSInfo, falling back to a
    /// full scan when FSInfo is absent or implausible.
    fn load_hints(&self, trust_free_count: bool) -> Result<()> {
        let end = self.boot.cluster_end();
        let mut fsinfo = None;
        if let Some(offset) = self.boot.fsinfo_offset() {
            let mut sector = [0u8; 512];
            self.device.read_at(&mut sector, offset)?;
            fsinfo = FsInfo::parse(&sector);
        }

        let free_count = match fsinfo {
            Some(info)
                if trust_free_count
                    && info.free_count != FSINFO_UNKNOWN
                    && info.free_count <= self.boot.num_usable_clusters() =>
            {
                info.free_count
            }
            _ => self.count_free()?,
        };
        let next_free_hint = match fsinfo {
            Some(info) if info.next_free >= 2 && info.next_free < end => info.next_free,
            _ => 2,
        };

        let mut state = self.state();
        state.fsinfo_valid = fsinfo.is_some();
        state.free_count = free_count;
        state.next_free_hint = next_free_hint;
        Ok(())
    }

    /// Count free entries in the primary FAT.
    fn count_free(&self) -> Result<u32> {
        let mut free = 0u32;
        self.scan(2, self.boot.cluster_end(), |_, entry| {
            if entry == 0 {
                free += 1;
            }
            false
        })?;
        Ok(free)
    }

    /// Walk primary FAT entries `from..to` in chunks, stopping at the first
    /// cluster for which `visit` returns true.
    fn scan(
        &self,
        from: u32,
        to: u32,
        mut visit: impl FnMut(u32, u32) -> bool,
    ) -> Result<Option<u32>> {
        let entry_size = self.fat_type().entry_size() as usize;
        let per_chunk = (SCAN_CHUNK / entry_size) as u32;
        let primary = self.boot.mirroring().primary_fat_index;
        let mask = self.fat_type().mask();
        let mut buf = vec![0u8; SCAN_CHUNK];

        let mut cluster = from;
        while cluster < to {
            let count = per_chunk.min(to - cluster);
            let bytes = &mut buf[..count as usize * entry_size];
            self.device
                .read_at(bytes, self.boot.cluster_location_fat(primary, cluster))?;
            for (i, raw) in bytes.chunks_exact(entry_size).enumerate() {
                let entry = match self.fat_type() {
                    FatType::Fat16 => LittleEndian::read_u16(raw) as u32,
                    FatType::Fat32 => LittleEndian::read_u32(raw) & mask,
                };
                let current = cluster + i as u32;
                if visit(current, entry) {
                    return Ok(Some(current));
                }
            }
            cluster += count;
        }
        Ok(None)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().closed {
            return Err(FatError::Unmounted);
        }
        Ok(())
    }

    fn check_range(&self, cluster: u32) -> Result<()> {
        if cluster < 2 || cluster >= self.boot.cluster_end() {
            return Err(FatError::InvalidCluster(cluster));
        }
        Ok(())
    }

    /// Read `cluster`'s entry straight from FAT copy `fat_index`, masked to
    /// the entry width. Index 0 and 1 (the reserved entries) are allowed.
    pub fn read_entry_in(&self, fat_index: u8, cluster: u32) -> Result<u32> {
        let offset = self.boot.cluster_location_fat(fat_index, cluster);
        match self.fat_type() {
            FatType::Fat16 => {
                let mut raw = [0u8; 2];
                self.device.read_at(&mut raw, offset)?;
                Ok(LittleEndian::read_u16(&raw) as u32)
            }
            FatType::Fat32 => {
                let mut raw = [0u8; 4];
                self.device.read_at(&mut raw, offset)?;
                Ok(LittleEndian::read_u32(&raw) & FatType::Fat32.mask())
            }
        }
    }

    fn write_entry_in(&self, fat_index: u8, cluster: u32, value: u32) -> Result<()> {
        let offset = self.boot.cluster_location_fat(fat_index, cluster);
        match self.fat_type() {
            FatType::Fat16 => {
                let mut raw = [0u8; 2];
                LittleEndian::write_u16(&mut raw, value as u16);
                self.device.write_at(&raw, offset)?;
            }
            FatType::Fat32 => {
                // Preserve upper 4 bits of original entry
                let mut raw = [0u8; 4];
                self.device.read_at(&mut raw, offset)?;
                let existing = LittleEndian::read_u32(&raw);
                let new_val = (existing & !FatType::Fat32.mask()) | (value & FatType::Fat32.mask());
                LittleEndian::write_u32(&mut raw, new_val);
                self.device.write_at(&raw, offset)?;
            }
        }
        Ok(())
    }

    /// Write the primary copy, then every mirror. Only the primary write can
    /// fail the call; mirror failures are counted and logged.
    fn write_all_copies(&self, cluster: u32, value: u32) -> Result<()> {
        let mirroring = self.boot.mirroring();
        self.write_entry_in(mirroring.primary_fat_index, cluster, value)?;
        if mirroring.active {
            for index in 0..mirroring.num_fats {
                if index == mirroring.primary_fat_index {
                    continue;
                }
                let outcome = BestEffort::new(self.write_entry_in(index, cluster, value));
                if !outcome.is_ok() {
                    self.mirror_failures.fetch_add(1, Ordering::Relaxed);
                }
                outcome.ignore("mirror FAT write");
            }
        }
        Ok(())
    }

    /// Entry for `cluster` from the primary table.
    pub fn get(&self, cluster: u32) -> Result<u32> {
        self.ensure_open()?;
        self.check_range(cluster)?;
        self.read_entry_in(self.boot.mirroring().primary_fat_index, cluster)
    }

    /// Point `cluster` at `value`.
    pub fn set(&self, value: u32, cluster: u32) -> Result<()> {
        let mut state = self.state();
        self.set_locked(&mut state, value, cluster)
    }

    fn set_locked(&self, state: &mut TableState, value: u32, cluster: u32) -> Result<()> {
        if state.closed {
            return Err(FatError::Unmounted);
        }
        if self.read_only {
            return Err(FatError::ReadOnly);
        }
        self.check_range(cluster)?;
        if value == cluster {
            return Err(FatError::InvalidCluster(cluster));
        }

        let value = value & self.fat_type().mask();
        let old = self.read_entry_in(self.boot.mirroring().primary_fat_index, cluster)?;
        self.write_all_copies(cluster, value)?;

        let fat_type = self.fat_type();
        if fat_type.is_free(old) && !fat_type.is_free(value) {
            state.free_count = state.free_count.saturating_sub(1);
        } else if !fat_type.is_free(old) && fat_type.is_free(value) {
            state.free_count = state.free_count.saturating_add(1);
        }
        Ok(())
    }

    /// Find a free cluster, mark it end-of-chain and return it.
    ///
    /// The search starts at the next-free hint and wraps once around the
    /// usable range.
    pub fn allocate(&self) -> Result<u32> {
        if self.read_only {
            return Err(FatError::ReadOnly);
        }
        let mut state = self.state();
        if state.closed {
            return Err(FatError::Unmounted);
        }

        let end = self.boot.cluster_end();
        let start = if state.next_free_hint >= 2 && state.next_free_hint < end {
            state.next_free_hint
        } else {
            2
        };

        let fat_type = self.fat_type();
        let is_candidate = |_: u32, entry: u32| fat_type.is_free(entry) && !fat_type.is_bad(entry);
        let found = match self.scan(start, end, is_candidate)? {
            Some(c) => Some(c),
            None => self.scan(2, start, is_candidate)?,
        };
        let Some(cluster) = found else {
            state.free_count = 0;
            return Err(FatError::NoSpace);
        };

        self.set_locked(&mut state, fat_type.eof_value(), cluster)?;
        state.next_free_hint = if cluster + 1 >= end { 2 } else { cluster + 1 };
        debug!("allocated cluster {cluster} ({} free)", state.free_count);
        Ok(cluster)
    }

    pub fn is_eof(&self, entry: u32) -> bool {
        self.fat_type().is_eof(entry)
    }

    pub fn is_free(&self, entry: u32) -> bool {
        self.fat_type().is_free(entry)
    }

    pub fn is_bad(&self, entry: u32) -> bool {
        self.fat_type().is_bad(entry)
    }

    pub fn eof_value(&self) -> u32 {
        self.fat_type().eof_value()
    }

    pub fn free_value(&self) -> u32 {
        0
    }

    pub fn bad_value(&self) -> u32 {
        self.fat_type().bad_value()
    }

    /// True when the clean-shutdown bit in FAT[1] is clear, or unreadable.
    ///
    /// FAT[1] is the authoritative copy. The boot-sector flag byte is kept
    /// in step by [`set_dirty`](Self::set_dirty) but not read back, since
    /// other formatters leave it zero on clean volumes.
    pub fn is_dirty(&self) -> bool {
        match self.read_entry_in(self.boot.mirroring().primary_fat_index, 1) {
            Ok(entry) => entry & self.fat_type().clean_bit() == 0,
            Err(_) => true,
        }
    }

    /// True when the no-error bit in FAT[1] is clear, or unreadable.
    pub fn is_hard_error(&self) -> bool {
        match self.read_entry_in(self.boot.mirroring().primary_fat_index, 1) {
            Ok(entry) => entry & self.fat_type().no_error_bit() == 0,
            Err(_) => true,
        }
    }

    /// Update both dirty conventions: bit 0 of the boot-sector flag byte and
    /// the high bits of FAT[1]. Dirty clears them, clean sets them.
    pub fn set_dirty(&self, dirty: bool) -> Result<()> {
        if self.read_only {
            return Err(FatError::ReadOnly);
        }
        let fat_type = self.fat_type();

        let flag_offset = fat_type.dirty_flag_offset();
        let mut flag = [0u8; 1];
        self.device.read_at(&mut flag, flag_offset)?;
        if dirty {
            flag[0] &= !0x01;
        } else {
            flag[0] |= 0x01;
        }
        self.device.write_at(&flag, flag_offset)?;

        let bits = fat_type.clean_bit() | fat_type.no_error_bit();
        let entry = self.read_entry_in(self.boot.mirroring().primary_fat_index, 1)?;
        let entry = if dirty { entry & !bits } else { entry | bits };
        self.write_all_copies(1, entry)
    }

    fn write_fsinfo(&self, free_count: u32, next_free: u32) -> Result<()> {
        let Some(offset) = self.boot.fsinfo_offset() else {
            return Ok(());
        };
        let mut sector = [0u8; 512];
        self.device.read_at(&mut sector, offset)?;
        FsInfo {
            free_count,
            next_free,
        }
        .write_to(&mut sector);
        self.device.write_at(&sector, offset)?;
        Ok(())
    }

    /// Mark the volume clean and persist the FSInfo hints. Every step is
    /// best effort; the table is closed afterwards regardless.
    pub fn close(&self) -> BestEffort {
        let mut state = self.state();
        if state.closed {
            return BestEffort::new(Ok(()));
        }
        state.closed = true;
        if self.read_only {
            return BestEffort::new(Ok(()));
        }

        if state.fsinfo_valid {
            BestEffort::new(self.write_fsinfo(state.free_count, state.next_free_hint))
                .ignore("FSInfo update");
        }
        let cleaned = self
            .set_dirty(false)
            .and_then(|()| self.device.flush().map_err(FatError::from));
        info!("{} table closed", self.fat_type().name());
        BestEffort::new(cleaned)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Advisory free-cluster count.
    pub fn free_count(&self) -> u32 {
        self.state().free_count
    }

    pub fn next_free_hint(&self) -> u32 {
        self.state().next_free_hint
    }

    /// Mirror writes that failed and were dropped since open.
    pub fn mirror_write_failures(&self) -> u64 {
        self.mirror_failures.load(Ordering::Relaxed)
    }

    pub fn bootrecord(&self) -> &Bootrecord {
        &self.boot
    }
}
