//! Error types for devmap

use std::path::PathBuf;

use thiserror::Error;

use crate::dm::abi::Command;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving device-mapper or a userspace volume
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Kernel Rejections
    // =========================================================================
    /// The kernel rejected a control call
    #[error("{command} failed for device '{device}': {} (errno {errno})", errno_message(.errno))]
    Ioctl {
        command: Command,
        device: String,
        errno: i32,
    },

    /// The control node could not be opened
    #[error("failed to open device-mapper control node {}: {source}", .path.display())]
    ControlOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Device listing did not fit even the largest allowed buffer
    #[error("device list does not fit in {limit} bytes after {attempts} attempts")]
    ListBufferExhausted { limit: usize, attempts: u32 },

    /// The kernel returned a buffer we could not decode
    #[error("malformed kernel response: {0}")]
    MalformedResponse(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Cipher not supported by the userspace crypt path
    #[error("unsupported cipher suite '{0}'")]
    UnsupportedCipher(String),

    /// Crypt sector size override is not a multiple of 512
    #[error("crypt sector size {0} must be a multiple of 512")]
    InvalidSectorSize(u32),

    /// Key material has a length the cipher cannot use
    #[error("invalid key length {0} for aes-xts (expected 32, 48 or 64 bytes)")]
    InvalidKeyLength(usize),

    /// Keyring keys never leave the kernel
    #[error("userspace crypt volume cannot use keyring key '{0}'")]
    KeyringKeyUnsupported(String),

    /// Request not aligned to the active sector size
    #[error("request at offset {offset} with length {length} is not aligned to {sector_size}-byte sectors")]
    Misaligned {
        offset: u64,
        length: usize,
        sector_size: u64,
    },

    /// Invalid configuration or table file
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Capability Gaps
    // =========================================================================
    /// Operation intentionally not implemented
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    // =========================================================================
    // Volume Errors
    // =========================================================================
    /// No target covers the offset, or it lies past the end of the backing address space
    #[error("offset {offset} is out of range")]
    OutOfRange { offset: u64 },

    /// Volume used after close
    #[error("volume is closed")]
    Closed,

    /// One or more constituent volumes failed to close
    #[error("failed to close {} volume(s): {}", .0.len(), join_errors(.0))]
    CloseFailed(Vec<Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Raw errno for kernel rejections.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Ioctl { errno, .. } => Some(*errno),
            Error::ControlOpen { source, .. } | Error::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error signals an intentionally unbuilt capability.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented(_))
    }
}

fn errno_message(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
