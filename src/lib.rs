//! devmap - Linux device-mapper control plane
//!
//! Builds device-mapper tables, drives their lifecycle through the kernel's
//! control node, and offers a userspace data path that reads and writes a
//! table's backing storage directly, including a dm-crypt compatible
//! AES-XTS implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Target model                            │
//! │          linear · zero · crypt · verity  ──►  build_spec()        │
//! └───────────────┬───────────────────────────────────┬──────────────┘
//!                 ▼                                   ▼
//! ┌───────────────────────────────┐   ┌──────────────────────────────┐
//! │  DeviceMapper (lifecycle)     │   │  Userspace volumes           │
//! │  create/load/resume/remove    │   │  CombinedVolume ─► per-target│
//! │        │                      │   │  linear/zero/crypt/verity    │
//! │        ▼                      │   └──────────────┬───────────────┘
//! │  abi: dm_ioctl encode/decode  │                  ▼
//! │        │                      │            backing files
//! │        ▼                      │
//! │  ControlChannel ─► ioctl(2)   │
//! └───────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`target`] - Table entries and their kernel parameter lines
//! - [`dm`] - Kernel ABI, control channel and device lifecycle
//! - [`volume`] - Userspace read/write over a table's backing storage
//! - [`config`] - Control tuning and table files
//! - [`error`] - Error types

pub mod config;
pub mod dm;
pub mod error;
pub mod target;
pub mod volume;

// Re-export commonly used types
pub use config::{ControlConfig, TableFile};
pub use dm::{
    create, create_and_load, get_version, info_by_devno, info_by_name, list, load, message,
    remove, rename, resume, set_uuid, suspend, ControlChannel, DevNo, DeviceInfo, DeviceMapper,
    DeviceState, DmFlags, KernelControl, ListItem, Version,
};
pub use error::{Error, Result};
pub use target::{
    CryptFlag, CryptKey, CryptTarget, LinearTarget, Target, VerityTarget, ZeroTarget,
    AES_XTS_PLAIN64, SECTOR_SIZE,
};
pub use volume::{open_userspace_volume, Access, CombinedVolume, Volume};
