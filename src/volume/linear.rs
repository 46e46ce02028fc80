//! Volume over a byte range of a backing file.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use super::{backend_position, Access, Volume};
use crate::error::{Error, Result};

/// Positional I/O shifted by a fixed byte offset.
#[derive(Debug)]
pub struct LinearVolume {
    file: Option<File>,
    offset: u64,
    writable: bool,
}

impl LinearVolume {
    pub fn open(path: &Path, offset: u64, access: Access, permissions: u32) -> Result<Self> {
        let file = access.open(path, permissions)?;
        debug!(path = %path.display(), offset, ?access, "opened linear volume");
        Ok(Self {
            file: Some(file),
            offset,
            writable: access.is_writable(),
        })
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Closed)
    }
}

impl Volume for LinearVolume {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file()?.read_at(buf, backend_position(self.offset, offset)?)?)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file()?.write_at(buf, backend_position(self.offset, offset)?)?)
    }

    fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) if self.writable => Ok(file.sync_all()?),
            Some(_) => Ok(()),
            None => Err(Error::Closed),
        }
    }
}
