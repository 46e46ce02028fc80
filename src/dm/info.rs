//! Values returned by the control interface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::abi::{DmFlags, Header, NameRecord};

// =============================================================================
// Device Number
// =============================================================================

/// Block device major/minor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevNo {
    pub major: u32,
    pub minor: u32,
}

impl DevNo {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Encode the way the kernel's `huge_encode_dev` does.
    pub fn to_kernel(self) -> u64 {
        let major = u64::from(self.major);
        let minor = u64::from(self.minor);
        (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)
    }

    /// Inverse of [`DevNo::to_kernel`].
    pub fn from_kernel(dev: u64) -> Self {
        let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
        let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
        Self {
            major: major as u32,
            minor: minor as u32,
        }
    }
}

impl fmt::Display for DevNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DevNo {
    type Err = String;

    /// Parse `MAJOR:MINOR`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| format!("expected MAJOR:MINOR, got {:?}", s))?;
        let major = major
            .trim()
            .parse()
            .map_err(|e| format!("invalid major {:?}: {}", major, e))?;
        let minor = minor
            .trim()
            .parse()
            .map_err(|e| format!("invalid minor {:?}: {}", minor, e))?;
        Ok(Self { major, minor })
    }
}

// =============================================================================
// Interface Version
// =============================================================================

/// Device-mapper interface version reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl From<[u32; 3]> for Version {
    fn from(v: [u32; 3]) -> Self {
        Self {
            major: v[0],
            minor: v[1],
            patch: v[2],
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// Device Status
// =============================================================================

/// Lifecycle position of a device, derived from its status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Exists without any table
    Created,
    /// Inactive table staged, nothing live yet
    TableLoaded,
    Active,
    Suspended,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Created => "created",
            DeviceState::TableLoaded => "table-loaded",
            DeviceState::Active => "active",
            DeviceState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Status snapshot of one mapped device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub uuid: String,
    pub devno: DevNo,
    /// Number of openers of the mapped block device
    pub open_count: i32,
    pub target_count: u32,
    pub event_nr: u32,
    pub flags: DmFlags,
}

impl DeviceInfo {
    pub fn state(&self) -> DeviceState {
        if self.flags.contains(DmFlags::SUSPEND) && self.flags.contains(DmFlags::ACTIVE_PRESENT) {
            DeviceState::Suspended
        } else if self.flags.contains(DmFlags::ACTIVE_PRESENT) {
            DeviceState::Active
        } else if self.flags.contains(DmFlags::INACTIVE_PRESENT) {
            DeviceState::TableLoaded
        } else {
            DeviceState::Created
        }
    }

    pub fn has_active_table(&self) -> bool {
        self.flags.contains(DmFlags::ACTIVE_PRESENT)
    }

    pub fn has_inactive_table(&self) -> bool {
        self.flags.contains(DmFlags::INACTIVE_PRESENT)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(DmFlags::READONLY)
    }
}

impl From<Header> for DeviceInfo {
    fn from(header: Header) -> Self {
        Self {
            name: header.name,
            uuid: header.uuid,
            devno: DevNo::from_kernel(header.dev),
            open_count: header.open_count,
            target_count: header.target_count,
            event_nr: header.event_nr,
            flags: header.flags,
        }
    }
}

/// One entry of the device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub name: String,
    pub devno: DevNo,
    /// Only reported by newer kernels
    pub event_nr: Option<u32>,
}

impl From<NameRecord> for ListItem {
    fn from(record: NameRecord) -> Self {
        Self {
            name: record.name,
            devno: DevNo::from_kernel(record.dev),
            event_nr: record.event_nr,
        }
    }
}
