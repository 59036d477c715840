//! Slot-level access to directory contents.
//!
//! A directory is addressed by its starting cluster. Cluster 0 names the
//! root: the fixed root region on FAT16, the root cluster chain on FAT32.
//! Slots are 32 bytes and numbered from 0 across the whole directory.

use std::sync::Arc;

use chrono::NaiveDateTime;
use log::debug;

use super::bootrecord::{Bootrecord, RootLocation};
use super::cluster::ClusterManager;
use super::entry::{
    cluster_of, set_cluster, set_mtime, short_name_bytes, DirEntry, ATTR_LONG_NAME,
    ATTR_VOLUME_ID, DIR_ENTRY_SIZE, DOTDOT_NAME, SLOT_DELETED, SLOT_END,
};
use crate::device::BlockDevice;
use crate::error::{FatError, Result};

/// What a slot holds.
#[derive(Debug, Clone, PartialEq)]
pub enum DirSlot {
    Entry(DirEntry),
    /// Released slot, or a record that is not a file or directory.
    Unused,
    /// End-of-directory marker or past the last slot.
    End,
}

/// Byte offsets backing a directory's slots.
struct SlotMap {
    /// Start of each contiguous run (one per cluster, or the root region).
    runs: Vec<u64>,
    slots_per_run: u32,
}

impl SlotMap {
    fn capacity(&self) -> u32 {
        self.runs.len() as u32 * self.slots_per_run
    }

    fn offset(&self, index: u32) -> Option<u64> {
        let run = self.runs.get((index / self.slots_per_run) as usize)?;
        Some(run + (index % self.slots_per_run) as u64 * DIR_ENTRY_SIZE as u64)
    }
}

/// Reads and writes directory records through the cluster manager.
pub struct DirentCodec {
    device: Arc<dyn BlockDevice>,
    boot: Arc<Bootrecord>,
    clusters: Arc<ClusterManager>,
}

impl DirentCodec {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        boot: Arc<Bootrecord>,
        clusters: Arc<ClusterManager>,
    ) -> Self {
        Self {
            device,
            boot,
            clusters,
        }
    }

    fn slot_map(&self, dir: u32) -> Result<SlotMap> {
        let chain_start = match (dir, self.boot.root()) {
            (0, RootLocation::Region {
                offset,
                max_entries,
            }) => {
                return Ok(SlotMap {
                    runs: vec![offset],
                    slots_per_run: max_entries as u32,
                })
            }
            (0, RootLocation::Cluster(root)) => root,
            (start, _) => start,
        };
        let runs = self
            .clusters
            .collect(chain_start)?
            .into_iter()
            .map(|c| self.boot.cluster_location_data(c))
            .collect();
        Ok(SlotMap {
            runs,
            slots_per_run: (self.boot.cluster_size() / DIR_ENTRY_SIZE as u64) as u32,
        })
    }

    /// Every slot of the directory, concatenated.
    fn load(&self, map: &SlotMap) -> Result<Vec<u8>> {
        let run_len = map.slots_per_run as usize * DIR_ENTRY_SIZE;
        let mut data = vec![0u8; run_len * map.runs.len()];
        for (chunk, &offset) in data.chunks_exact_mut(run_len).zip(&map.runs) {
            self.device.read_at(chunk, offset)?;
        }
        Ok(data)
    }

    fn read_raw(&self, map: &SlotMap, index: u32) -> Result<[u8; DIR_ENTRY_SIZE]> {
        let offset = map
            .offset(index)
            .ok_or_else(|| FatError::InvalidArgs(format!("directory slot {index} out of range")))?;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        self.device.read_at(&mut raw, offset)?;
        Ok(raw)
    }

    fn write_raw(&self, map: &SlotMap, index: u32, raw: &[u8; DIR_ENTRY_SIZE]) -> Result<()> {
        let offset = map
            .offset(index)
            .ok_or_else(|| FatError::InvalidArgs(format!("directory slot {index} out of range")))?;
        self.device.write_at(raw, offset)?;
        Ok(())
    }

    /// Find `name` in `dir`. Names compare in their 8.3 form.
    pub fn lookup(&self, dir: u32, name: &str) -> Result<(DirEntry, u32)> {
        let wanted = short_name_bytes(name)?;
        let map = self.slot_map(dir)?;
        let data = self.load(&map)?;
        for (index, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            match classify(raw) {
                SlotKind::End => break,
                SlotKind::Short if raw[0..11] == wanted => {
                    return Ok((DirEntry::decode(raw), index as u32));
                }
                _ => {}
            }
        }
        Err(FatError::NotFound(name.to_string()))
    }

    /// Read the record at `index`, skipping any long-name slots in front of
    /// a short entry. Returns the slot and how many slots it spanned.
    pub fn read(&self, dir: u32, index: u32) -> Result<(DirSlot, u32)> {
        let map = self.slot_map(dir)?;
        let mut consumed = 0;
        let mut current = index;
        while current < map.capacity() {
            let raw = self.read_raw(&map, current)?;
            consumed += 1;
            match classify(&raw) {
                SlotKind::End => return Ok((DirSlot::End, consumed)),
                SlotKind::Short => return Ok((DirSlot::Entry(DirEntry::decode(&raw)), consumed)),
                SlotKind::LongName => current += 1,
                SlotKind::Unused => return Ok((DirSlot::Unused, consumed)),
            }
        }
        Ok((DirSlot::End, consumed.max(1)))
    }

    /// Every live entry with its slot index, `.` and `..` included.
    pub fn entries(&self, dir: u32) -> Result<Vec<(u32, DirEntry)>> {
        let map = self.slot_map(dir)?;
        let data = self.load(&map)?;
        let mut entries = Vec::new();
        for (index, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            match classify(raw) {
                SlotKind::End => break,
                SlotKind::Short => entries.push((index as u32, DirEntry::decode(raw))),
                _ => {}
            }
        }
        Ok(entries)
    }

    /// Store `entry` in the first free slot, growing the directory by one
    /// cluster when it is full. The fixed FAT16 root cannot grow.
    pub fn allocate(&self, dir: u32, entry: &DirEntry) -> Result<u32> {
        let raw = entry.encode()?;
        let mut map = self.slot_map(dir)?;
        let data = self.load(&map)?;
        let free = data
            .chunks_exact(DIR_ENTRY_SIZE)
            .position(|slot| slot[0] == SLOT_END || slot[0] == SLOT_DELETED);

        let index = match free {
            Some(index) => index as u32,
            None => {
                let is_region = dir == 0 && matches!(self.boot.root(), RootLocation::Region { .. });
                if is_region {
                    return Err(FatError::NoSpace);
                }
                let tail = self.chain_tail(dir)?;
                let added = self.clusters.extend(tail)?;
                debug!("directory {dir} grew into cluster {added}");
                let index = map.capacity();
                map.runs.push(self.boot.cluster_location_data(added));
                index
            }
        };
        self.write_raw(&map, index, &raw)?;
        Ok(index)
    }

    fn chain_tail(&self, dir: u32) -> Result<u32> {
        let start = if dir == 0 { self.boot.root_cluster() } else { dir };
        self.clusters
            .collect(start)?
            .last()
            .copied()
            .ok_or(FatError::InvalidCluster(start))
    }

    /// Rewrite the cluster, mtime and size of the record at `index`.
    /// Returns the cluster it pointed at before.
    pub fn update(
        &self,
        dir: u32,
        cluster: u32,
        mtime: NaiveDateTime,
        size: u32,
        index: u32,
    ) -> Result<u32> {
        let map = self.slot_map(dir)?;
        let mut raw = self.read_raw(&map, index)?;
        if classify(&raw) != SlotKind::Short {
            return Err(FatError::NotFound(format!("no entry in slot {index}")));
        }
        let old = cluster_of(&raw);
        set_cluster(&mut raw, cluster);
        set_mtime(&mut raw, mtime);
        raw[28..32].copy_from_slice(&size.to_le_bytes());
        self.write_raw(&map, index, &raw)?;
        Ok(old)
    }

    /// Release the record at `index` and the long-name slots that belong
    /// to it. Returns the released entry.
    pub fn free(&self, dir: u32, index: u32) -> Result<DirEntry> {
        let map = self.slot_map(dir)?;
        let mut raw = self.read_raw(&map, index)?;
        if classify(&raw) != SlotKind::Short {
            return Err(FatError::NotFound(format!("no entry in slot {index}")));
        }
        let entry = DirEntry::decode(&raw);
        raw[0] = SLOT_DELETED;
        self.write_raw(&map, index, &raw)?;

        let mut prev = index;
        while prev > 0 {
            prev -= 1;
            let mut lfn = self.read_raw(&map, prev)?;
            if classify(&lfn) != SlotKind::LongName {
                break;
            }
            lfn[0] = SLOT_DELETED;
            self.write_raw(&map, prev, &lfn)?;
        }
        Ok(entry)
    }

    /// True if `dir` holds nothing besides `.` and `..`.
    pub fn is_empty(&self, dir: u32) -> Result<bool> {
        Ok(self.entries(dir)?.iter().all(|(_, e)| e.is_dot()))
    }

    /// Write `.` and `..` into a freshly allocated, zeroed directory
    /// cluster. `parent` is 0 when the parent is the root.
    pub fn init_directory(&self, cluster: u32, parent: u32, mtime: NaiveDateTime) -> Result<()> {
        let map = self.slot_map(cluster)?;
        let dot = DirEntry::new_directory(".", cluster, mtime).encode()?;
        let dotdot = DirEntry::new_directory("..", parent, mtime).encode()?;
        self.write_raw(&map, 0, &dot)?;
        self.write_raw(&map, 1, &dotdot)
    }

    /// Starting cluster of `dir`'s parent, read from its `..` record.
    /// 0 means the root.
    pub fn parent_of(&self, dir: u32) -> Result<u32> {
        if dir == 0 {
            return Ok(0);
        }
        let map = self.slot_map(dir)?;
        let raw = self.read_raw(&map, 1)?;
        if raw[0..11] != DOTDOT_NAME {
            return Err(FatError::MalformedChain(format!(
                "directory {dir} has no '..' entry"
            )));
        }
        Ok(cluster_of(&raw))
    }

    /// Point `dir`'s `..` record at `parent`.
    pub fn set_parent(&self, dir: u32, parent: u32) -> Result<()> {
        let map = self.slot_map(dir)?;
        let mut raw = self.read_raw(&map, 1)?;
        if raw[0..11] != DOTDOT_NAME {
            return Err(FatError::MalformedChain(format!(
                "directory {dir} has no '..' entry"
            )));
        }
        set_cluster(&mut raw, parent);
        self.write_raw(&map, 1, &raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    End,
    Unused,
    LongName,
    Short,
}

fn classify(raw: &[u8]) -> SlotKind {
    if raw[0] == SLOT_END {
        SlotKind::End
    } else if raw[0] == SLOT_DELETED {
        SlotKind::Unused
    } else if raw[11] & ATTR_LONG_NAME == ATTR_LONG_NAME {
        SlotKind::LongName
    } else if raw[11] & ATTR_VOLUME_ID != 0 {
        SlotKind::Unused
    } else {
        SlotKind::Short
    }
}
