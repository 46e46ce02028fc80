//! Transport for control calls.
//!
//! [`ControlChannel`] is the seam between request encoding and the kernel:
//! production code talks to `/dev/mapper/control`, tests substitute an
//! in-memory channel that inspects requests and fabricates responses.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::abi::{self, Command, HEADER_SIZE};
use crate::config::DEFAULT_CONTROL_PATH;
use crate::error::{Error, Result};

/// Something that can carry one device-mapper control call.
pub trait ControlChannel {
    /// Issue `command` with `buffer` as the in/out argument.
    ///
    /// On success the kernel's response has been written over `buffer`.
    fn ioctl(&self, command: Command, buffer: &mut [u8]) -> Result<()>;
}

/// Channel backed by the kernel control node.
///
/// The node is opened for each call and closed when it returns, so no
/// descriptor outlives an operation.
#[derive(Debug, Clone)]
pub struct KernelControl {
    path: PathBuf,
}

impl KernelControl {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for KernelControl {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_PATH)
    }
}

impl ControlChannel for KernelControl {
    fn ioctl(&self, command: Command, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} buffer shorter than the control header", command),
            )));
        }

        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| Error::ControlOpen {
                path: self.path.clone(),
                source,
            })?;

        trace!(%command, size = buffer.len(), "ioctl");

        // SAFETY: `buffer` is an exclusively borrowed allocation at least as
        // large as the header, and the header's data_size field never
        // exceeds `buffer.len()`, so the kernel stays within bounds.
        let ret = unsafe {
            libc::ioctl(
                control.as_raw_fd(),
                command.request() as _,
                buffer.as_mut_ptr(),
            )
        };
        if ret < 0 {
            let errno = io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(Error::Ioctl {
                command,
                device: abi::request_label(buffer),
                errno,
            });
        }
        Ok(())
    }
}
