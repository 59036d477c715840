use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs::bootrecord::FatType;

/// How a volume is mounted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Refuse every mutation; the dirty flag is left untouched.
    pub read_only: bool,
    /// Mount even if the volume records a hard error or an unclean
    /// shutdown. Meant for recovery tools, not for normal use.
    pub force: bool,
}

impl MountOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid mount options")
    }

    /// Load options from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read mount options from {}", path.display()))?;
        Self::from_json(&text)
    }
}

/// Parameters for creating a fresh volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub fat_type: FatType,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub num_fats: u8,
    /// Root directory slots (FAT16 only).
    pub root_entries: u16,
    pub label: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fat_type: FatType::Fat32,
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            num_fats: 2,
            root_entries: 512,
            label: "NO NAME".into(),
        }
    }
}

impl FormatOptions {
    pub fn fat16(sectors_per_cluster: u8) -> Self {
        Self {
            fat_type: FatType::Fat16,
            sectors_per_cluster,
            ..Self::default()
        }
    }

    pub fn fat32(sectors_per_cluster: u8) -> Self {
        Self {
            fat_type: FatType::Fat32,
            sectors_per_cluster,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid format options")
    }
}
