//! dm-linear: remap a sector range onto another block device.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::SECTOR_SIZE;
use crate::error::Result;
use crate::volume::{Access, LinearVolume, Volume};

pub(crate) const TARGET_TYPE: &str = "linear";

/// Linear mapping onto `backend_device` starting at `backend_offset` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearTarget {
    /// First sector within the mapped device
    pub start: u64,
    /// Length in sectors
    pub length: u64,
    /// Device or file holding the data
    pub backend_device: PathBuf,
    /// Byte offset into the backend device
    #[serde(default)]
    pub backend_offset: u64,
}

impl LinearTarget {
    pub fn new(
        start: u64,
        length: u64,
        backend_device: impl Into<PathBuf>,
        backend_offset: u64,
    ) -> Self {
        Self {
            start,
            length,
            backend_device: backend_device.into(),
            backend_offset,
        }
    }

    pub(crate) fn build_spec(&self) -> String {
        format!(
            "{} {}",
            self.backend_device.display(),
            self.backend_offset / SECTOR_SIZE
        )
    }

    pub(crate) fn open_volume(&self, access: Access, permissions: u32) -> Result<Box<dyn Volume>> {
        let volume = LinearVolume::open(
            &self.backend_device,
            self.backend_offset,
            access,
            permissions,
        )?;
        Ok(Box::new(volume))
    }
}
