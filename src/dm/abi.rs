//! Kernel control ABI (`linux/dm-ioctl.h`)
//!
//! Every device-mapper control call passes one buffer: a fixed `struct
//! dm_ioctl` header followed by a variable payload. For table loads the
//! payload is a chain of `struct dm_target_spec` records, each followed by
//! its NUL-terminated parameter string and padded to 8 bytes.
//!
//! ```text
//! 0        312                 352                        352+N
//! ┌────────┬───────────────────┬──────────────────────────┬───────┐
//! │dm_ioctl│ dm_target_spec #0 │ "params\0" + pad to 8    │ #1 ...│
//! └────────┴───────────────────┴──────────────────────────┴───────┘
//!            next = 40 + roundUp(len(params) + 1, 8)
//! ```
//!
//! Field offsets are spelled out here and nowhere else; the rest of the
//! crate only sees [`Request`], [`Header`] and [`NameRecord`].

use std::fmt;

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::target::Target;

// =============================================================================
// Layout Constants
// =============================================================================

/// ioctl type byte for device-mapper
pub const DM_IOCTL: u8 = 0xfd;

/// Minimum interface version this crate declares
pub const DM_VERSION: [u32; 3] = [4, 0, 0];

/// Width of the name field, including the terminating NUL
pub const DM_NAME_LEN: usize = 128;

/// Width of the UUID field, including the terminating NUL
pub const DM_UUID_LEN: usize = 129;

/// Width of the target type field
pub const DM_MAX_TYPE_NAME: usize = 16;

/// `sizeof(struct dm_ioctl)`
pub const HEADER_SIZE: usize = 312;

/// `sizeof(struct dm_target_spec)`
pub const TARGET_SPEC_SIZE: usize = 40;

/// `offsetof(struct dm_name_list, name)`
const NAME_LIST_NAME_OFFSET: usize = 12;

const ALIGNMENT: usize = 8;

const OFFSET_NAME: usize = 48;
const OFFSET_UUID: usize = OFFSET_NAME + DM_NAME_LEN;
const OFFSET_DATA: usize = OFFSET_UUID + DM_UUID_LEN;

/// Marks an event as originating from this tool rather than a udev replay
pub const DM_UDEV_PRIMARY_SOURCE_FLAG: u32 = 0x0040;
const DM_UDEV_FLAGS_SHIFT: u32 = 16;

/// Event number cookie for operations udev treats as primary (resume, remove, rename).
pub const UDEV_PRIMARY_EVENT: u32 = DM_UDEV_PRIMARY_SOURCE_FLAG << DM_UDEV_FLAGS_SHIFT;

/// Round `n` up to the next multiple of `align`.
pub fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

// =============================================================================
// Commands and Flags
// =============================================================================

/// Control commands issued by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    ListDevices,
    DevCreate,
    DevRemove,
    DevSuspend,
    DevStatus,
    TableLoad,
}

impl Command {
    /// Command number within the device-mapper ioctl space.
    pub fn nr(self) -> u8 {
        match self {
            Command::Version => 0,
            Command::ListDevices => 2,
            Command::DevCreate => 3,
            Command::DevRemove => 4,
            Command::DevSuspend => 6,
            Command::DevStatus => 7,
            Command::TableLoad => 9,
        }
    }

    /// Full request code, `_IOWR(DM_IOCTL, nr, struct dm_ioctl)`.
    pub fn request(self) -> u64 {
        const IOC_READ_WRITE: u64 = 3;
        (IOC_READ_WRITE << 30)
            | ((HEADER_SIZE as u64) << 16)
            | ((DM_IOCTL as u64) << 8)
            | u64::from(self.nr())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Version => "DM_VERSION",
            Command::ListDevices => "DM_LIST_DEVICES",
            Command::DevCreate => "DM_DEV_CREATE",
            Command::DevRemove => "DM_DEV_REMOVE",
            Command::DevSuspend => "DM_DEV_SUSPEND",
            Command::DevStatus => "DM_DEV_STATUS",
            Command::TableLoad => "DM_TABLE_LOAD",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// `dm_ioctl.flags` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
    pub struct DmFlags: u32 {
        const READONLY = 1 << 0;
        const SUSPEND = 1 << 1;
        const PERSISTENT_DEV = 1 << 3;
        const STATUS_TABLE = 1 << 4;
        const ACTIVE_PRESENT = 1 << 5;
        const INACTIVE_PRESENT = 1 << 6;
        const BUFFER_FULL = 1 << 8;
        const SKIP_BDGET = 1 << 9;
        const SKIP_LOCKFS = 1 << 10;
        const NOFLUSH = 1 << 11;
        const QUERY_INACTIVE_TABLE = 1 << 12;
        const UEVENT_GENERATED = 1 << 13;
        const UUID = 1 << 14;
        const SECURE_DATA = 1 << 15;
        const DATA_OUT = 1 << 16;
        const DEFERRED_REMOVE = 1 << 17;
        const INTERNAL_SUSPEND = 1 << 18;
    }
}

// =============================================================================
// Request Encoding
// =============================================================================

/// Input to one control call.
#[derive(Debug, Default)]
pub struct Request<'a> {
    pub name: &'a str,
    pub uuid: &'a str,
    pub flags: DmFlags,
    pub event_nr: u32,
    /// Encoded device number, used for lookups without a name
    pub dev: u64,
    pub targets: &'a [Target],
    /// Minimum buffer size; the kernel writes variable-length results into the slack
    pub min_size: usize,
}

impl Request<'_> {
    /// Encode into the byte layout the kernel expects.
    ///
    /// The result is zeroized on drop because crypt tables carry key material.
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let specs: Vec<Zeroizing<String>> = self
            .targets
            .iter()
            .map(|t| Zeroizing::new(t.build_spec()))
            .collect();
        let payload: usize = specs
            .iter()
            .map(|spec| TARGET_SPEC_SIZE + round_up(spec.len() + 1, ALIGNMENT))
            .sum();
        let size = (HEADER_SIZE + payload).max(self.min_size);

        let mut buf = Zeroizing::new(Vec::with_capacity(size));
        for part in DM_VERSION {
            buf.put_u32_ne(part);
        }
        buf.put_u32_ne(size as u32); // data_size
        buf.put_u32_ne(HEADER_SIZE as u32); // data_start
        buf.put_u32_ne(self.targets.len() as u32);
        buf.put_i32_ne(0); // open_count
        buf.put_u32_ne(self.flags.bits());
        buf.put_u32_ne(self.event_nr);
        buf.put_u32_ne(0); // padding
        buf.put_u64_ne(self.dev);
        put_fixed_str(&mut buf, "name", self.name, DM_NAME_LEN);
        put_fixed_str(&mut buf, "uuid", self.uuid, DM_UUID_LEN);
        buf.put_bytes(0, HEADER_SIZE - OFFSET_DATA);
        debug_assert_eq!(buf.len(), HEADER_SIZE);

        for (target, spec) in self.targets.iter().zip(&specs) {
            let padded = round_up(spec.len() + 1, ALIGNMENT);
            buf.put_u64_ne(target.start());
            buf.put_u64_ne(target.length());
            buf.put_i32_ne(0); // status
            buf.put_u32_ne((TARGET_SPEC_SIZE + padded) as u32); // next
            put_fixed_str(&mut buf, "target type", target.target_type(), DM_MAX_TYPE_NAME);
            buf.put_slice(spec.as_bytes());
            buf.put_bytes(0, padded - spec.len());
        }

        buf.resize(size, 0);
        buf
    }
}

/// Write `value` into a NUL-padded field of `width` bytes, keeping the
/// last byte as terminator. Longer values are cut at the field boundary.
fn put_fixed_str(buf: &mut Vec<u8>, field: &str, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width - 1);
    if len < bytes.len() {
        debug!(field, value, width, "truncating over-long field");
    }
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
}

// =============================================================================
// Response Decoding
// =============================================================================

/// Decoded `struct dm_ioctl` as returned by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: [u32; 3],
    pub data_size: u32,
    pub data_start: u32,
    pub target_count: u32,
    pub open_count: i32,
    pub flags: DmFlags,
    pub event_nr: u32,
    pub dev: u64,
    pub name: String,
    pub uuid: String,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedResponse(format!(
                "buffer of {} bytes is shorter than the {}-byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let mut cur = &buf[..OFFSET_NAME];
        let version = [cur.get_u32_ne(), cur.get_u32_ne(), cur.get_u32_ne()];
        let data_size = cur.get_u32_ne();
        let data_start = cur.get_u32_ne();
        let target_count = cur.get_u32_ne();
        let open_count = cur.get_i32_ne();
        let flags = DmFlags::from_bits_retain(cur.get_u32_ne());
        let event_nr = cur.get_u32_ne();
        let _padding = cur.get_u32_ne();
        let dev = cur.get_u64_ne();

        Ok(Self {
            version,
            data_size,
            data_start,
            target_count,
            open_count,
            flags,
            event_nr,
            dev,
            name: fixed_str(&buf[OFFSET_NAME..OFFSET_UUID]),
            uuid: fixed_str(&buf[OFFSET_UUID..OFFSET_DATA]),
        })
    }

    /// Byte range of the result payload inside the response buffer.
    pub fn payload_range(&self, buf_len: usize) -> Result<std::ops::Range<usize>> {
        let start = self.data_start as usize;
        let end = self.data_size as usize;
        if start > end || end > buf_len {
            return Err(Error::MalformedResponse(format!(
                "payload {}..{} outside {}-byte buffer",
                start, end, buf_len
            )));
        }
        Ok(start..end)
    }
}

/// Decode a NUL-padded fixed-width string field.
fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Human label for the device addressed by an encoded request.
pub fn request_label(buf: &[u8]) -> String {
    match Header::decode(buf) {
        Ok(header) if !header.name.is_empty() => header.name,
        Ok(header) if header.dev != 0 => format!("devno {:#x}", header.dev),
        _ => "-".to_string(),
    }
}

/// One entry of a `DM_LIST_DEVICES` result (`struct dm_name_list`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRecord {
    pub dev: u64,
    pub name: String,
    /// Present on kernels that append the event counter (interface 4.37+)
    pub event_nr: Option<u32>,
}

/// Walk the `dm_name_list` chain of a list response.
pub fn decode_name_list(buf: &[u8], header: &Header) -> Result<Vec<NameRecord>> {
    let payload = header.payload_range(buf.len())?;
    let mut records = Vec::new();
    if payload.len() < NAME_LIST_NAME_OFFSET {
        return Ok(records);
    }

    let mut offset = payload.start;
    loop {
        if offset + NAME_LIST_NAME_OFFSET > payload.end {
            return Err(Error::MalformedResponse(format!(
                "name list record at {} overruns payload end {}",
                offset, payload.end
            )));
        }
        let mut cur = &buf[offset..offset + NAME_LIST_NAME_OFFSET];
        let dev = cur.get_u64_ne();
        let next = cur.get_u32_ne() as usize;
        if dev == 0 && records.is_empty() {
            // kernel marks an empty list with a zero device number
            return Ok(records);
        }

        let name_start = offset + NAME_LIST_NAME_OFFSET;
        let record_end = if next == 0 { payload.end } else { offset + next };
        if record_end > payload.end || record_end <= name_start {
            return Err(Error::MalformedResponse(format!(
                "name list record at {} has invalid next offset {}",
                offset, next
            )));
        }
        let name_len = buf[name_start..record_end]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| {
                Error::MalformedResponse(format!("unterminated device name at {}", name_start))
            })?;
        let name = String::from_utf8_lossy(&buf[name_start..name_start + name_len]).into_owned();

        let event_offset = round_up(name_start + name_len + 1, ALIGNMENT);
        let event_nr = (event_offset + 8 <= record_end).then(|| {
            let mut cur = &buf[event_offset..event_offset + 4];
            cur.get_u32_ne()
        });

        records.push(NameRecord {
            dev,
            name,
            event_nr,
        });

        if next == 0 {
            return Ok(records);
        }
        offset += next;
    }
}
