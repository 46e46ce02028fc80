//! dm-zero: reads return zeros, writes are dropped.

use serde::{Deserialize, Serialize};

use crate::volume::{Volume, ZeroVolume};

pub(crate) const TARGET_TYPE: &str = "zero";

/// Zero-filled sector range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroTarget {
    pub start: u64,
    pub length: u64,
}

impl ZeroTarget {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub(crate) fn build_spec(&self) -> String {
        String::new()
    }

    pub(crate) fn open_volume(&self) -> Box<dyn Volume> {
        Box::new(ZeroVolume)
    }
}
