//! Userspace Volumes
//!
//! Reads and writes a mapping's data directly from its backing files,
//! without asking the kernel to create a device. Each target type has a
//! volume implementation; [`CombinedVolume`] stitches them together in
//! table order so the result addresses the same bytes the mapped device
//! would.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CombinedVolume                        │
//! │  offset ──► range lookup ──► target-relative offset       │
//! └──────┬──────────────┬──────────────┬──────────────┬───────┘
//!        ▼              ▼              ▼              ▼
//!   LinearVolume    ZeroVolume    CryptVolume    VerityVolume
//!   (pread/pwrite)  (zero fill)   (AES-XTS)      (unsupported)
//!        │                            │
//!        └──────── backing file ◄─────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use devmap::{open_userspace_volume, Access, LinearTarget, Target, Volume};
//!
//! let table = vec![Target::from(LinearTarget::new(0, 8, "/tmp/backing.img", 0))];
//! let mut volume = open_userspace_volume(Access::ReadOnly, 0, &table)?;
//! let mut buf = vec![0u8; 4096];
//! let read = volume.read_at(&mut buf, 0)?;
//! assert!(read <= buf.len());
//! volume.close()?;
//! # Ok::<(), devmap::Error>(())
//! ```

mod combined;
mod crypt;
mod linear;
mod verity;
mod xts;
mod zero;

mod proptest;

pub use combined::CombinedVolume;
pub use crypt::CryptVolume;
pub use linear::LinearVolume;
pub use verity::VerityVolume;
pub use zero::ZeroVolume;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::target::Target;

// =============================================================================
// Volume Trait
// =============================================================================

/// Random-access storage with an explicit close.
///
/// Offsets are relative to the start of whatever the volume represents.
/// A short count from either call is not an error; it means the backing
/// storage ended early.
pub trait Volume: Send {
    /// Read into `buf` starting at `offset`, returning the bytes produced.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at `offset`, returning the bytes accepted.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Release the backing resources. Later I/O fails with [`Error::Closed`].
    fn close(&mut self) -> Result<()>;
}

// =============================================================================
// Access Mode
// =============================================================================

/// How backing files are opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    ReadOnly,
    ReadWrite,
    /// Read-write, creating missing backing files
    Create,
}

impl Access {
    pub fn is_writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }

    /// Open `path` with this mode. `permissions` applies only when a file is created.
    pub(crate) fn open(self, path: &Path, permissions: u32) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        match self {
            Access::ReadOnly => {}
            Access::ReadWrite => {
                options.write(true);
            }
            Access::Create => {
                options.write(true).create(true).mode(permissions);
            }
        }
        Ok(options.open(path)?)
    }
}

/// Reject requests that do not start and end on a `sector_size` boundary.
pub(crate) fn check_alignment(offset: u64, length: usize, sector_size: u64) -> Result<()> {
    if offset % sector_size != 0 || length as u64 % sector_size != 0 {
        return Err(Error::Misaligned {
            offset,
            length,
            sector_size,
        });
    }
    Ok(())
}

/// Position in the backing file of `offset`, shifted by `base` bytes.
pub(crate) fn backend_position(base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset).ok_or(Error::OutOfRange { offset })
}

/// Open every target of `targets` in userspace and join them into one volume.
///
/// # Arguments
///
/// * `access` - open mode for backing files
/// * `permissions` - mode bits for files created under [`Access::Create`]
/// * `targets` - the table, in any order
///
/// # Errors
///
/// Fails if any target cannot be opened; volumes opened before the failure
/// are closed first.
pub fn open_userspace_volume(
    access: Access,
    permissions: u32,
    targets: &[Target],
) -> Result<CombinedVolume> {
    CombinedVolume::open(access, permissions, targets)
}
