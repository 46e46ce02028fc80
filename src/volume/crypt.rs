//! Userspace dm-crypt volume.
//!
//! Produces and consumes exactly the ciphertext the kernel's crypt target
//! would for the same table entry, so a backing file written here can be
//! mapped by the kernel and vice versa.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use tracing::debug;
use zeroize::Zeroizing;

use super::xts::SectorCipher;
use super::{backend_position, check_alignment, Access, Volume};
use crate::error::{Error, Result};
use crate::target::{CryptKey, CryptTarget, SECTOR_SIZE};

pub struct CryptVolume {
    file: Option<File>,
    writable: bool,
    backend_offset: u64,
    sector_size: u64,
    iv_offset: u64,
    iv_large_sectors: bool,
    cipher: SectorCipher,
}

impl CryptVolume {
    /// Validate `target` and open its backing device.
    ///
    /// # Errors
    ///
    /// Checked in order: sector size, key source, cipher suite and key
    /// length, then the backing file itself.
    pub fn open(target: &CryptTarget, access: Access, permissions: u32) -> Result<Self> {
        let sector_size = effective_sector_size(target.sector_size)?;
        let key = match &target.key {
            CryptKey::Raw(bytes) => bytes,
            CryptKey::Keyring(id) => return Err(Error::KeyringKeyUnsupported(id.clone())),
        };
        let cipher = SectorCipher::new(&target.cipher, key)?;
        let file = access.open(&target.backend_device, permissions)?;

        debug!(
            path = %target.backend_device.display(),
            sector_size,
            key_bits = cipher.key_bits(),
            iv_offset = target.iv_tweak,
            "opened crypt volume"
        );

        Ok(Self {
            file: Some(file),
            writable: access.is_writable(),
            backend_offset: target.backend_offset,
            sector_size,
            iv_offset: target.iv_tweak,
            iv_large_sectors: target.iv_large_sectors(),
            cipher,
        })
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Closed)
    }

    fn sectors_per_block(&self) -> u64 {
        self.sector_size / SECTOR_SIZE
    }

    /// IV sector for the `index`-th crypt sector of a request at `offset`.
    fn iv_sector(&self, offset: u64, index: u64) -> u64 {
        let sector = (offset / SECTOR_SIZE)
            .wrapping_add(index * self.sectors_per_block())
            .wrapping_add(self.iv_offset);
        if self.iv_large_sectors {
            sector / self.sectors_per_block()
        } else {
            sector
        }
    }
}

/// 0 means the kernel default of 512.
fn effective_sector_size(sector_size: u32) -> Result<u64> {
    match u64::from(sector_size) {
        0 => Ok(SECTOR_SIZE),
        n if n % SECTOR_SIZE == 0 => Ok(n),
        _ => Err(Error::InvalidSectorSize(sector_size)),
    }
}

impl Volume for CryptVolume {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(offset, buf.len(), self.sector_size)?;
        let file = self.file()?;

        let position = backend_position(self.backend_offset, offset)?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], position + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let sector_size = self.sector_size as usize;
        let whole = filled - filled % sector_size;
        for (index, sector) in buf[..whole].chunks_exact_mut(sector_size).enumerate() {
            self.cipher
                .decrypt_sector(sector, self.iv_sector(offset, index as u64));
        }
        // a trailing partial sector cannot be decrypted
        buf[whole..filled].fill(0);
        Ok(whole)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(offset, buf.len(), self.sector_size)?;
        let file = self.file()?;

        let mut ciphertext = Zeroizing::new(buf.to_vec());
        for (index, sector) in ciphertext
            .chunks_exact_mut(self.sector_size as usize)
            .enumerate()
        {
            self.cipher
                .encrypt_sector(sector, self.iv_sector(offset, index as u64));
        }
        file.write_all_at(&ciphertext, backend_position(self.backend_offset, offset)?)?;
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) if self.writable => Ok(file.sync_all()?),
            Some(_) => Ok(()),
            None => Err(Error::Closed),
        }
    }
}

impl fmt::Debug for CryptVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptVolume")
            .field("open", &self.file.is_some())
            .field("backend_offset", &self.backend_offset)
            .field("sector_size", &self.sector_size)
            .field("iv_offset", &self.iv_offset)
            .field("iv_large_sectors", &self.iv_large_sectors)
            .field("key_bits", &self.cipher.key_bits())
            .finish()
    }
}
