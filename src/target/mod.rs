//! Device-mapper Target Model
//!
//! A [`Target`] describes one contiguous sector range of a mapped device and
//! knows how to render itself into the parameter line the kernel's target
//! parser expects. A table is simply an ordered slice of targets.
//!
//! # Parameter Grammar
//!
//! ```text
//! linear  <device> <offset>
//! zero    (no parameters)
//! crypt   <cipher> <key> <iv_offset> <device> <offset> <#opt_params> <opt_params>...
//! verity  <version> <data_dev> <hash_dev> <data_block_size> <hash_block_size>
//!         <num_data_blocks> <hash_start_block> <algorithm> <digest> <salt> <opt>...
//! ```
//!
//! # Example
//!
//! ```
//! use devmap::{LinearTarget, Target, ZeroTarget};
//!
//! let table = vec![
//!     Target::from(LinearTarget::new(0, 8, "/dev/loop0", 0)),
//!     Target::from(ZeroTarget::new(8, 8)),
//! ];
//! assert_eq!(table[0].build_spec(), "/dev/loop0 0");
//! assert_eq!(table[1].target_type(), "zero");
//! ```

pub mod crypt;
pub mod linear;
pub mod verity;
pub mod zero;

pub use crypt::{CryptFlag, CryptKey, CryptTarget, AES_XTS_PLAIN64};
pub use linear::LinearTarget;
pub use verity::VerityTarget;
pub use zero::ZeroTarget;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::volume::{Access, Volume};

/// Kernel sector size. All kernel-facing offsets and lengths use this unit.
pub const SECTOR_SIZE: u64 = 512;

// =============================================================================
// Target
// =============================================================================

/// One entry of a device-mapper table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    Linear(LinearTarget),
    Zero(ZeroTarget),
    Crypt(CryptTarget),
    Verity(VerityTarget),
}

impl Target {
    /// First sector of this target within the mapped device.
    pub fn start(&self) -> u64 {
        match self {
            Target::Linear(t) => t.start,
            Target::Zero(t) => t.start,
            Target::Crypt(t) => t.start,
            Target::Verity(t) => t.start,
        }
    }

    /// Number of sectors covered by this target.
    pub fn length(&self) -> u64 {
        match self {
            Target::Linear(t) => t.length,
            Target::Zero(t) => t.length,
            Target::Crypt(t) => t.length,
            Target::Verity(t) => t.length,
        }
    }

    /// Kernel target type name.
    pub fn target_type(&self) -> &'static str {
        match self {
            Target::Linear(_) => linear::TARGET_TYPE,
            Target::Zero(_) => zero::TARGET_TYPE,
            Target::Crypt(_) => crypt::TARGET_TYPE,
            Target::Verity(_) => verity::TARGET_TYPE,
        }
    }

    /// Kernel parameter line for this target.
    pub fn build_spec(&self) -> String {
        match self {
            Target::Linear(t) => t.build_spec(),
            Target::Zero(t) => t.build_spec(),
            Target::Crypt(t) => t.build_spec(),
            Target::Verity(t) => t.build_spec(),
        }
    }

    /// Open a userspace volume over this target's backing storage.
    ///
    /// The returned volume addresses bytes relative to the target start.
    pub fn open_volume(&self, access: Access, permissions: u32) -> Result<Box<dyn Volume>> {
        match self {
            Target::Linear(t) => t.open_volume(access, permissions),
            Target::Zero(t) => Ok(t.open_volume()),
            Target::Crypt(t) => t.open_volume(access, permissions),
            Target::Verity(t) => Ok(t.open_volume()),
        }
    }

    /// Whether loading this target hands raw key material to the kernel.
    pub(crate) fn carries_secret(&self) -> bool {
        matches!(self, Target::Crypt(t) if matches!(t.key, CryptKey::Raw(_)))
    }
}

impl From<LinearTarget> for Target {
    fn from(t: LinearTarget) -> Self {
        Target::Linear(t)
    }
}

impl From<ZeroTarget> for Target {
    fn from(t: ZeroTarget) -> Self {
        Target::Zero(t)
    }
}

impl From<CryptTarget> for Target {
    fn from(t: CryptTarget) -> Self {
        Target::Crypt(t)
    }
}

impl From<VerityTarget> for Target {
    fn from(t: VerityTarget) -> Self {
        Target::Verity(t)
    }
}
