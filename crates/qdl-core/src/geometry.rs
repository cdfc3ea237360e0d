//! Storage types and the block geometry derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target storage technology, in boundary enum order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Unknown,
    Emmc,
    Nand,
    Ufs,
    Nvme,
    Spinor,
}

impl StorageType {
    pub const ALL: [StorageType; 6] = [
        StorageType::Unknown,
        StorageType::Emmc,
        StorageType::Nand,
        StorageType::Ufs,
        StorageType::Nvme,
        StorageType::Spinor,
    ];

    /// Map a C enum value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn geometry(self) -> StorageGeometry {
        StorageGeometry::for_storage(self)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Unknown => write!(f, "unknown"),
            StorageType::Emmc => write!(f, "emmc"),
            StorageType::Nand => write!(f, "nand"),
            StorageType::Ufs => write!(f, "ufs"),
            StorageType::Nvme => write!(f, "nvme"),
            StorageType::Spinor => write!(f, "spinor"),
        }
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(StorageType::Unknown),
            "emmc" => Ok(StorageType::Emmc),
            "nand" => Ok(StorageType::Nand),
            "ufs" => Ok(StorageType::Ufs),
            "nvme" => Ok(StorageType::Nvme),
            "spinor" | "spi-nor" => Ok(StorageType::Spinor),
            other => Err(format!("unknown storage type: {other}")),
        }
    }
}

/// Block geometry of a storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageGeometry {
    pub storage: StorageType,
    /// Fixed sector size, or `None` when each directive declares its own.
    pub sector_size: Option<usize>,
    /// `MemoryName` sent in the Firehose `<configure>`.
    pub memory_name: &'static str,
}

impl StorageGeometry {
    pub const MIN_SECTOR_SIZE: usize = 512;

    pub fn for_storage(storage: StorageType) -> Self {
        let (sector_size, memory_name) = match storage {
            StorageType::Unknown => (None, "ufs"),
            StorageType::Emmc => (Some(512), "emmc"),
            StorageType::Nand => (Some(4096), "nand"),
            StorageType::Ufs => (Some(4096), "ufs"),
            StorageType::Nvme => (Some(512), "nvme"),
            StorageType::Spinor => (Some(4096), "spinor"),
        };
        Self {
            storage,
            sector_size,
            memory_name,
        }
    }

    /// Whether a directive-declared sector size is usable with this geometry.
    pub fn accepts_sector_size(&self, declared: usize) -> bool {
        match self.sector_size {
            Some(fixed) => declared == fixed,
            None => declared >= Self::MIN_SECTOR_SIZE && declared.is_power_of_two(),
        }
    }

    /// Round `bytes` up to a whole number of `sector_size` sectors.
    pub fn round_up(bytes: u64, sector_size: usize) -> u64 {
        bytes.div_ceil(sector_size as u64) * sector_size as u64
    }

    /// Largest multiple of `sector_size` not above `requested`, at least one sector.
    pub fn align_chunk(requested: usize, sector_size: usize) -> usize {
        ((requested / sector_size) * sector_size).max(sector_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values_follow_boundary_order() {
        assert_eq!(StorageType::from_raw(0), Some(StorageType::Unknown));
        assert_eq!(StorageType::from_raw(1), Some(StorageType::Emmc));
        assert_eq!(StorageType::from_raw(3), Some(StorageType::Ufs));
        assert_eq!(StorageType::from_raw(5), Some(StorageType::Spinor));
        assert_eq!(StorageType::from_raw(6), None);
        assert_eq!(StorageType::from_raw(-1), None);
    }

    #[test]
    fn test_sector_sizes() {
        assert_eq!(StorageType::Emmc.geometry().sector_size, Some(512));
        assert_eq!(StorageType::Ufs.geometry().sector_size, Some(4096));
        assert_eq!(StorageType::Nvme.geometry().memory_name, "nvme");
        assert!(StorageType::Unknown.geometry().accepts_sector_size(4096));
        assert!(!StorageType::Unknown.geometry().accepts_sector_size(1000));
        assert!(!StorageType::Emmc.geometry().accepts_sector_size(4096));
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(StorageGeometry::round_up(4096, 512), 4096);
        assert_eq!(StorageGeometry::round_up(4097, 512), 4608);
        assert_eq!(StorageGeometry::round_up(0, 512), 0);
        assert_eq!(StorageGeometry::align_chunk(1024, 512), 1024);
        assert_eq!(StorageGeometry::align_chunk(1500, 512), 1024);
        assert_eq!(StorageGeometry::align_chunk(100, 4096), 4096);
    }

    #[test]
    fn test_parse_storage_names() {
        assert_eq!("UFS".parse::<StorageType>().unwrap(), StorageType::Ufs);
        assert_eq!("spi-nor".parse::<StorageType>().unwrap(), StorageType::Spinor);
        assert!("floppy".parse::<StorageType>().is_err());
    }
}
