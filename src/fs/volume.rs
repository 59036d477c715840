//! A mounted FAT volume: ties the boot record, cluster manager, directory
//! codec and directory cache together and carries file data I/O.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Local, NaiveDateTime};
use log::info;
use serde::Serialize;

use super::bootrecord::{Bootrecord, FatType, BOOT_SECTOR_SIZE};
use super::cluster::ClusterManager;
use super::dcache::DirCache;
use super::dirent::DirentCodec;
use super::entry::{fat_epoch, DirEntry, EntryKind};
use super::fat::FatTable;
use super::node::{DirNode, FileNode, FileState, Node, NodeId};
use crate::config::MountOptions;
use crate::device::BlockDevice;
use crate::error::{FatError, Result};

/// Volume-wide figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeStat {
    pub fat_type: FatType,
    pub cluster_size: u64,
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub label: Option<String>,
    pub read_only: bool,
    pub mirror_write_failures: u64,
}

/// Current attributes of an open node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub kind: EntryKind,
    pub start_cluster: u32,
    pub size: u32,
    pub mtime: NaiveDateTime,
}

pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub struct FatVolume {
    /// Shared for ordinary operations, exclusive for rename and unmount.
    /// The flag is false once unmounted.
    mounted: RwLock<bool>,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) boot: Arc<Bootrecord>,
    pub(crate) clusters: Arc<ClusterManager>,
    pub(crate) codec: DirentCodec,
    pub(crate) dcache: DirCache,
    pub(crate) options: MountOptions,
    root: Arc<DirNode>,
}

impl FatVolume {
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        device.read_at(&mut sector, 0)?;
        let boot = Arc::new(Bootrecord::parse(&sector, device.size())?);

        let fat = FatTable::open(device.clone(), boot.clone(), options.read_only, options.force)?;
        let clusters = Arc::new(ClusterManager::new(device.clone(), boot.clone(), fat));
        let codec = DirentCodec::new(device.clone(), boot.clone(), clusters.clone());
        let dcache = DirCache::new();
        // Pinned until unmount.
        let root = dcache.create_or_acquire(NodeId::ROOT, 0, fat_epoch());

        info!(
            "mounted {} volume{}: {} clusters of {} bytes{}",
            boot.fat_type().name(),
            boot.label().map(|l| format!(" '{l}'")).unwrap_or_default(),
            boot.num_usable_clusters(),
            boot.cluster_size(),
            if options.read_only { " (read-only)" } else { "" }
        );

        Ok(Self {
            mounted: RwLock::new(true),
            device,
            boot,
            clusters,
            codec,
            dcache,
            options,
            root,
        })
    }

    pub(crate) fn shared(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self
            .mounted
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !*guard {
            return Err(FatError::Unmounted);
        }
        Ok(guard)
    }

    pub(crate) fn exclusive(&self) -> Result<RwLockWriteGuard<'_, bool>> {
        let guard = self
            .mounted
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !*guard {
            return Err(FatError::Unmounted);
        }
        Ok(guard)
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(FatError::ReadOnly);
        }
        Ok(())
    }

    pub fn bootrecord(&self) -> &Bootrecord {
        &self.boot
    }

    /// Chain-level access, for diagnostics and tools.
    pub fn clusters(&self) -> &ClusterManager {
        &self.clusters
    }

    pub fn is_mounted(&self) -> bool {
        self.shared().is_ok()
    }

    /// Write back open files, mark the volume clean and flush. Every later
    /// call fails with `Unmounted`.
    pub fn unmount(&self) -> Result<()> {
        let mut mounted = self.exclusive()?;
        *mounted = false;

        let flushed = self.flush_open_files();
        self.clusters.unmount();
        let synced = self.device.flush();
        self.dcache.release(&self.root);
        info!("unmounted {} volume", self.boot.fat_type().name());

        flushed?;
        synced?;
        Ok(())
    }

    fn flush_open_files(&self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        for dir in self.dcache.resident() {
            let guard = dir.lock();
            let children: Vec<Arc<FileNode>> = guard.children.values().cloned().collect();
            for file in children {
                self.flush_locked(&guard, &file)?;
            }
        }
        Ok(())
    }

    pub fn stat(&self) -> Result<VolumeStat> {
        let _shared = self.shared()?;
        Ok(VolumeStat {
            fat_type: self.boot.fat_type(),
            cluster_size: self.boot.cluster_size(),
            total_clusters: self.boot.num_usable_clusters(),
            free_clusters: self.clusters.free_count()?,
            label: self.boot.label().map(str::to_string),
            read_only: self.options.read_only,
            mirror_write_failures: self.clusters.mirror_write_failures()?,
        })
    }

    /// A new handle on the root directory.
    pub fn root(&self) -> Result<Node> {
        let _shared = self.shared()?;
        self.dcache.add_ref(&self.root);
        Ok(Node::Directory(self.root.clone()))
    }

    /// Give back a handle. The last close of a file writes its size and
    /// mtime to its directory entry.
    pub fn close(&self, node: Node) -> Result<()> {
        let _shared = self.shared()?;
        match node {
            Node::Directory(dir) => {
                self.dcache.drop_ref(&dir);
                Ok(())
            }
            Node::File(file) => self.flush_on_close(&file, true),
        }
    }

    /// Write a file's metadata back and flush the device.
    pub fn sync(&self, node: &Node) -> Result<()> {
        let _shared = self.shared()?;
        if let Node::File(file) = node {
            self.flush_on_close(file, false)?;
        }
        self.device.flush()?;
        Ok(())
    }

    pub fn node_info(&self, node: &Node) -> Result<NodeInfo> {
        let _shared = self.shared()?;
        match node {
            Node::Directory(dir) => {
                let guard = dir.lock();
                let start_cluster = if dir.id().is_root() {
                    self.boot.root_cluster()
                } else {
                    guard.start_cluster
                };
                Ok(NodeInfo {
                    kind: EntryKind::Directory,
                    start_cluster,
                    size: 0,
                    mtime: guard.mtime,
                })
            }
            Node::File(file) => self.with_file_state(file, |_, state| {
                Ok(NodeInfo {
                    kind: EntryKind::File,
                    start_cluster: state.start_cluster,
                    size: state.size,
                    mtime: state.mtime,
                })
            }),
        }
    }

    /// Entries of a directory, without `.` and `..`. Open files report their
    /// in-memory size.
    pub fn read_dir(&self, dir: &Node) -> Result<Vec<DirEntry>> {
        let _shared = self.shared()?;
        let Node::Directory(dir) = dir else {
            return Err(FatError::NotADir("read_dir on a file".into()));
        };
        let guard = dir.lock();
        let mut entries = Vec::new();
        for (index, mut entry) in self.codec.entries(guard.start_cluster)? {
            if entry.is_dot() {
                continue;
            }
            if let Some(child) = guard.children.get(&index) {
                let state = guard.lock_file(child);
                entry.start_cluster = state.start_cluster;
                entry.size = state.size;
                entry.mtime = state.mtime;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn read(&self, file: &Node, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _shared = self.shared()?;
        let Node::File(file) = file else {
            return Err(FatError::NotAFile("read on a directory".into()));
        };
        self.with_file_state(file, |_, state| {
            let size = state.size as u64;
            if offset >= size || buf.is_empty() {
                return Ok(0);
            }
            let len = (size - offset).min(buf.len() as u64) as usize;
            let chain = self.clusters.collect(state.start_cluster)?;
            if (chain.len() as u64) * self.boot.cluster_size() < offset + len as u64 {
                return Err(FatError::MalformedChain(format!(
                    "chain at {} is shorter than the file size {size}",
                    state.start_cluster
                )));
            }
            self.read_span(&chain, offset, &mut buf[..len])?;
            Ok(len)
        })
    }

    pub fn write(&self, file: &Node, offset: u64, data: &[u8]) -> Result<usize> {
        let _shared = self.shared()?;
        self.check_writable()?;
        let Node::File(file) = file else {
            return Err(FatError::NotAFile("write on a directory".into()));
        };
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or_else(|| FatError::InvalidArgs("write past the 4 GiB file size limit".into()))?;

        self.with_file_state(file, |_, state| {
            let cluster_size = self.boot.cluster_size();
            let mut chain = self.clusters.collect(state.start_cluster)?;
            let allocated = chain.len() as u64 * cluster_size;
            self.grow_chain(state, &mut chain, end.div_ceil(cluster_size) as usize)?;
            if offset > state.size as u64 {
                self.zero_span(&chain, state.size as u64, offset.min(allocated))?;
            }
            self.write_span(&chain, offset, data)?;
            state.size = state.size.max(end as u32);
            state.mtime = now();
            state.modified = true;
            Ok(data.len())
        })
    }

    /// Grow (zero-filled) or shrink a file.
    pub fn set_size(&self, file: &Node, size: u64) -> Result<()> {
        let _shared = self.shared()?;
        self.check_writable()?;
        let Node::File(file) = file else {
            return Err(FatError::NotAFile("set_size on a directory".into()));
        };
        let size = u32::try_from(size)
            .map_err(|_| FatError::InvalidArgs(format!("file size {size} exceeds 4 GiB")))?;
        self.with_file_state(file, |_, state| self.resize_locked(state, size))
    }

    /// Lock `file` through its parent and run `f` on its state. `f` also
    /// gets the parent's start cluster.
    pub(crate) fn with_file_state<T>(
        &self,
        file: &FileNode,
        f: impl FnOnce(u32, &mut FileState) -> Result<T>,
    ) -> Result<T> {
        let parent = self.file_parent(file)?;
        let guard = parent.lock();
        let mut state = guard.lock_file(file);
        f(guard.start_cluster, &mut *state)
    }

    /// The directory an open file belongs to. Open files hold it resident.
    pub(crate) fn file_parent(&self, file: &FileNode) -> Result<Arc<DirNode>> {
        let link = file.parent();
        self.dcache
            .peek(link.dir)
            .ok_or_else(|| FatError::NotFound(format!("parent directory {:?} of open file", link.dir)))
    }

    pub(crate) fn resize_locked(&self, state: &mut FileState, size: u32) -> Result<()> {
        let cluster_size = self.boot.cluster_size();
        let current = state.size;
        if size < current {
            let keep = (size as u64).div_ceil(cluster_size) as usize;
            if keep == 0 {
                if state.start_cluster != 0 {
                    self.clusters.delete(state.start_cluster)?;
                    state.start_cluster = 0;
                }
            } else {
                let chain = self.clusters.collect(state.start_cluster)?;
                if chain.len() > keep {
                    self.clusters.truncate(chain[keep - 1])?;
                }
            }
        } else if size > current {
            let mut chain = self.clusters.collect(state.start_cluster)?;
            let allocated = chain.len() as u64 * cluster_size;
            self.grow_chain(state, &mut chain, (size as u64).div_ceil(cluster_size) as usize)?;
            self.zero_span(&chain, current as u64, (size as u64).min(allocated))?;
        }
        state.size = size;
        state.mtime = now();
        state.modified = true;
        Ok(())
    }

    fn grow_chain(&self, state: &mut FileState, chain: &mut Vec<u32>, needed: usize) -> Result<()> {
        while chain.len() < needed {
            let tail = chain.last().copied().unwrap_or(0);
            let cluster = self.clusters.extend(tail)?;
            if chain.is_empty() {
                state.start_cluster = cluster;
                state.modified = true;
            }
            chain.push(cluster);
        }
        Ok(())
    }

    /// Visit the device extents covering `len` bytes at `pos` of a chain.
    fn for_each_extent(
        &self,
        chain: &[u32],
        pos: u64,
        len: usize,
        mut f: impl FnMut(u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let cluster_size = self.boot.cluster_size();
        let mut done = 0usize;
        while done < len {
            let at = pos + done as u64;
            let within = at % cluster_size;
            let cluster = chain[(at / cluster_size) as usize];
            let n = ((cluster_size - within) as usize).min(len - done);
            f(self.boot.cluster_location_data(cluster) + within, done..done + n)?;
            done += n;
        }
        Ok(())
    }

    fn read_span(&self, chain: &[u32], pos: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.for_each_extent(chain, pos, len, |offset, range| {
            self.device.read_at(&mut buf[range], offset)?;
            Ok(())
        })
    }

    fn write_span(&self, chain: &[u32], pos: u64, data: &[u8]) -> Result<()> {
        self.for_each_extent(chain, pos, data.len(), |offset, range| {
            self.device.write_at(&data[range], offset)?;
            Ok(())
        })
    }

    fn zero_span(&self, chain: &[u32], from: u64, to: u64) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let zeros = vec![0u8; (to - from) as usize];
        self.write_span(chain, from, &zeros)
    }
}
