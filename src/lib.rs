//! A FAT16/FAT32 volume engine for block devices and disk images.
//!
//! [`FatVolume`] mounts a volume from any [`BlockDevice`] and exposes a
//! handle-based API that is safe to share between threads.

pub mod config;
pub mod device;
pub mod error;
pub mod fs;

pub use config::{FormatOptions, MountOptions};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use error::{BestEffort, FatError, Result};
pub use fs::{format_volume, FatVolume, Node, OpenFlags};
