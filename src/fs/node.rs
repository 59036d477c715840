//! In-memory nodes for open directories and files.
//!
//! Directory nodes are shared through the [`DirCache`](super::dcache::DirCache);
//! file nodes live in their parent directory's child table. A file's state
//! can only be locked through a held [`DirGuard`] of its parent, which keeps
//! the parent-before-child lock order.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;

use super::bootrecord::Bootrecord;
use super::entry::EntryKind;

/// Identity of a directory: its starting cluster, with the root always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    /// Identity of the directory starting at `cluster`. Both 0 and the
    /// FAT32 root cluster map to the root.
    pub fn of_cluster(cluster: u32, boot: &Bootrecord) -> Self {
        if cluster == 0 || cluster == boot.root_cluster() {
            Self::ROOT
        } else {
            Self(cluster)
        }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Cluster to store in a child's `..` record.
    pub fn dotdot_cluster(&self) -> u32 {
        self.0
    }
}

/// Where an entry lives: its directory and slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRef {
    pub dir: NodeId,
    pub index: u32,
}

pub struct DirState {
    /// Cluster handed to the directory codec (0 for the root).
    pub start_cluster: u32,
    pub mtime: NaiveDateTime,
    /// Open files, keyed by slot index.
    pub children: HashMap<u32, Arc<FileNode>>,
}

pub struct DirNode {
    id: NodeId,
    /// Cache-level pins (in-flight operations, open children).
    pub(crate) holds: AtomicUsize,
    /// Open handles.
    pub(crate) refs: AtomicUsize,
    state: Mutex<DirState>,
}

impl DirNode {
    pub(crate) fn new(id: NodeId, start_cluster: u32, mtime: NaiveDateTime) -> Self {
        Self {
            id,
            holds: AtomicUsize::new(0),
            refs: AtomicUsize::new(0),
            state: Mutex::new(DirState {
                start_cluster,
                mtime,
                children: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn holds(&self) -> usize {
        self.holds.load(Ordering::Acquire)
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> DirGuard<'_> {
        DirGuard {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// A locked directory. The only way to reach a child file's state.
pub struct DirGuard<'a> {
    state: MutexGuard<'a, DirState>,
}

impl DirGuard<'_> {
    /// Lock a child file. The file guard cannot outlive this guard.
    pub fn lock_file<'g>(&'g self, file: &'g FileNode) -> MutexGuard<'g, FileState> {
        file.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Deref for DirGuard<'_> {
    type Target = DirState;

    fn deref(&self) -> &DirState {
        &self.state
    }
}

impl DerefMut for DirGuard<'_> {
    fn deref_mut(&mut self) -> &mut DirState {
        &mut self.state
    }
}

pub struct FileState {
    pub start_cluster: u32,
    pub size: u32,
    pub mtime: NaiveDateTime,
    /// Open handles.
    pub refs: usize,
    /// The directory entry is gone; the chain is released on last close.
    pub deleted: bool,
    /// In-memory state differs from the directory entry.
    pub modified: bool,
}

pub struct FileNode {
    /// Changed only by rename, under the volume's exclusive lock.
    link: Mutex<ParentRef>,
    state: Mutex<FileState>,
}

impl FileNode {
    pub(crate) fn new(parent: ParentRef, start_cluster: u32, size: u32, mtime: NaiveDateTime) -> Self {
        Self {
            link: Mutex::new(parent),
            state: Mutex::new(FileState {
                start_cluster,
                size,
                mtime,
                refs: 0,
                deleted: false,
                modified: false,
            }),
        }
    }

    pub fn parent(&self) -> ParentRef {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn relink(&self, parent: ParentRef) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = parent;
    }
}

/// An open handle. Each value accounts for one reference and must be given
/// back through `FatVolume::close`.
pub enum Node {
    Directory(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl Node {
    pub fn kind(&self) -> EntryKind {
        match self {
            Node::Directory(_) => EntryKind::Directory,
            Node::File(_) => EntryKind::File,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    /// True if both handles refer to the same in-memory node.
    pub fn same_node(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Directory(a), Node::Directory(b)) => Arc::ptr_eq(a, b),
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Directory(d) => write!(f, "Directory({:?})", d.id()),
            Node::File(file) => write!(f, "File({:?})", file.parent()),
        }
    }
}
