//! Whole-chain operations on top of the FAT.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use super::bootrecord::Bootrecord;
use super::fat::FatTable;
use crate::device::BlockDevice;
use crate::error::{BestEffort, FatError, Result};

/// Serializes chain walks and mutations. Owns the FAT for the lifetime of
/// the mount; every call fails with [`FatError::Unmounted`] afterwards.
pub struct ClusterManager {
    device: Arc<dyn BlockDevice>,
    boot: Arc<Bootrecord>,
    fat: Mutex<Option<FatTable>>,
}

impl ClusterManager {
    pub fn new(device: Arc<dyn BlockDevice>, boot: Arc<Bootrecord>, fat: FatTable) -> Self {
        Self {
            device,
            boot,
            fat: Mutex::new(Some(fat)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<FatTable>> {
        self.fat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_fat<T>(&self, f: impl FnOnce(&FatTable) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        match guard.as_ref() {
            Some(fat) => f(fat),
            None => Err(FatError::Unmounted),
        }
    }

    /// True if `value` terminates a chain.
    pub fn is_eof(&self, value: u32) -> bool {
        self.boot.fat_type().is_eof(value)
    }

    /// All clusters of the chain starting at `start`, in link order.
    pub fn collect(&self, start: u32) -> Result<Vec<u32>> {
        self.with_fat(|fat| collect_chain(fat, start))
    }

    /// Append a zero-filled cluster after `cluster` and return it.
    ///
    /// `cluster` is either the tail of a chain or 0 / an EOF value, in which
    /// case a new chain is started.
    pub fn extend(&self, cluster: u32) -> Result<u32> {
        self.with_fat(|fat| {
            let new_chain = cluster == 0 || fat.is_eof(cluster);
            if !new_chain {
                let next = fat.get(cluster)?;
                if !fat.is_eof(next) {
                    return Err(FatError::InvalidArgs(format!(
                        "cluster {cluster} is not the end of its chain"
                    )));
                }
            }

            let new_cluster = fat.allocate()?;
            let linked = self.zero_fill(new_cluster).and_then(|()| {
                if new_chain {
                    Ok(())
                } else {
                    fat.set(new_cluster, cluster)
                }
            });
            if let Err(e) = linked {
                BestEffort::new(fat.set(fat.free_value(), new_cluster))
                    .ignore("freeing unlinked cluster");
                return Err(e);
            }
            debug!("extended chain at {cluster} with {new_cluster}");
            Ok(new_cluster)
        })
    }

    fn zero_fill(&self, cluster: u32) -> Result<()> {
        let zeros = vec![0u8; self.boot.cluster_size() as usize];
        self.device
            .write_at(&zeros, self.boot.cluster_location_data(cluster))?;
        Ok(())
    }

    /// Make `cluster` the last cluster of its chain, freeing the rest.
    pub fn truncate(&self, cluster: u32) -> Result<()> {
        self.with_fat(|fat| remove_after(fat, cluster, true))
    }

    /// Free `cluster` and everything after it.
    pub fn delete(&self, cluster: u32) -> Result<()> {
        self.with_fat(|fat| remove_after(fat, cluster, false))
    }

    pub fn free_count(&self) -> Result<u32> {
        self.with_fat(|fat| Ok(fat.free_count()))
    }

    /// Raw FAT entry of `cluster`.
    pub fn entry(&self, cluster: u32) -> Result<u32> {
        self.with_fat(|fat| fat.get(cluster))
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.with_fat(|fat| Ok(fat.is_dirty()))
    }

    pub fn mirror_write_failures(&self) -> Result<u64> {
        self.with_fat(|fat| Ok(fat.mirror_write_failures()))
    }

    pub fn is_read_only(&self) -> Result<bool> {
        self.with_fat(|fat| Ok(fat.is_read_only()))
    }

    /// Close the FAT. Later calls fail with `Unmounted`.
    pub fn unmount(&self) {
        let table = self.lock().take();
        if let Some(fat) = table {
            fat.close().ignore("marking volume clean");
        }
    }
}

fn collect_chain(fat: &FatTable, start: u32) -> Result<Vec<u32>> {
    let mut chain = Vec::new();
    if fat.is_free(start) || fat.is_eof(start) {
        return Ok(chain);
    }
    let mut seen = HashSet::new();
    let mut current = start;
    loop {
        if !seen.insert(current) {
            return Err(FatError::MalformedChain(format!(
                "loop at cluster {current} in chain starting at {start}"
            )));
        }
        chain.push(current);
        let next = fat.get(current)?;
        if fat.is_eof(next) {
            return Ok(chain);
        }
        if fat.is_free(next) {
            return Err(FatError::MalformedChain(format!(
                "cluster {current} links to a free entry"
            )));
        }
        if fat.is_bad(next) {
            return Err(FatError::MalformedChain(format!(
                "cluster {current} links to a bad cluster"
            )));
        }
        current = next;
    }
}

/// Cut the chain at `cluster`. With `keep` the cluster stays as the new
/// tail; otherwise it is freed too. Clusters freed before an error stay
/// freed.
fn remove_after(fat: &FatTable, cluster: u32, keep: bool) -> Result<()> {
    if fat.is_free(cluster) || fat.is_eof(cluster) {
        return Ok(());
    }
    let mut next = fat.get(cluster)?;
    if fat.is_free(next) {
        return Ok(());
    }

    if keep {
        fat.set(fat.eof_value(), cluster)?;
    } else {
        fat.set(fat.free_value(), cluster)?;
    }

    let mut seen = HashSet::from([cluster]);
    let mut freed = usize::from(!keep);
    while !fat.is_eof(next) && !fat.is_free(next) {
        if fat.is_bad(next) || !seen.insert(next) {
            return Err(FatError::MalformedChain(format!(
                "bad link to {next} while freeing chain at {cluster}"
            )));
        }
        let following = fat.get(next)?;
        fat.set(fat.free_value(), next)?;
        freed += 1;
        next = following;
    }
    debug!("freed {freed} clusters at {cluster}");
    Ok(())
}
