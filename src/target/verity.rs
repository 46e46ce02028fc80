//! dm-verity: read-only integrity verification against a hash tree.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::volume::{VerityVolume, Volume};

pub(crate) const TARGET_TYPE: &str = "verity";

/// Verity mapping. Only the kernel walks the hash tree, so the userspace
/// volume for this target refuses all I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerityTarget {
    pub start: u64,
    pub length: u64,
    /// On-disk hash format version (1 for the current format)
    #[serde(default = "default_hash_type")]
    pub hash_type: u32,
    /// Device whose integrity is checked
    pub data_device: PathBuf,
    /// Device supplying the hash tree
    pub hash_device: PathBuf,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub num_data_blocks: u64,
    /// Offset of the hash tree root, in hash blocks
    #[serde(default)]
    pub hash_start_block: u64,
    /// Hash algorithm name, e.g. `sha256`
    pub algorithm: String,
    /// Hex-encoded root digest
    pub digest: String,
    /// Hex-encoded salt, or `-` for none
    pub salt: String,
    /// Optional parameters appended verbatim (the caller supplies the count token)
    #[serde(default)]
    pub params: Vec<String>,
}

fn default_hash_type() -> u32 {
    1
}

impl VerityTarget {
    pub(crate) fn build_spec(&self) -> String {
        let mut args = vec![
            self.hash_type.to_string(),
            self.data_device.display().to_string(),
            self.hash_device.display().to_string(),
            self.data_block_size.to_string(),
            self.hash_block_size.to_string(),
            self.num_data_blocks.to_string(),
            self.hash_start_block.to_string(),
            self.algorithm.clone(),
            self.digest.clone(),
            self.salt.clone(),
        ];
        args.extend(self.params.iter().cloned());
        args.join(" ")
    }

    pub(crate) fn open_volume(&self) -> Box<dyn Volume> {
        Box::new(VerityVolume)
    }
}
