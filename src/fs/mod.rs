//! The FAT engine: on-disk structures at the bottom, the mounted volume and
//! its namespace operations on top.

pub mod bootrecord;
pub mod cluster;
pub mod dcache;
pub mod dirent;
pub mod entry;
pub mod fat;
pub mod format;
pub mod node;
pub mod ops;
pub mod volume;

pub use bootrecord::{Bootrecord, FatType, Mirroring, RootLocation};
pub use entry::{DirEntry, EntryKind};
pub use format::format_volume;
pub use node::{Node, NodeId};
pub use ops::OpenFlags;
pub use volume::{FatVolume, NodeInfo, VolumeStat};
