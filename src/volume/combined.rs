//! Several target volumes presented as one address space.

use std::fmt;
use std::ops::Range;

use tracing::{debug, warn};

use super::{check_alignment, Access, Volume};
use crate::error::{Error, Result};
use crate::target::{Target, SECTOR_SIZE};

struct VolumeRange {
    /// Sectors covered in the combined address space
    sectors: Range<u64>,
    volume: Box<dyn Volume>,
}

/// Volume that routes each request to the targets covering it.
///
/// Requests must be aligned to 512 bytes. A request spanning several
/// targets is split at target boundaries; each piece is handed to its
/// target with a target-relative offset.
pub struct CombinedVolume {
    ranges: Vec<VolumeRange>,
}

impl CombinedVolume {
    /// Join pre-opened volumes. Each entry is `(start, length, volume)` in
    /// sectors; entries may be given in any order.
    pub fn new(parts: Vec<(u64, u64, Box<dyn Volume>)>) -> Self {
        let mut ranges: Vec<VolumeRange> = parts
            .into_iter()
            .map(|(start, length, volume)| VolumeRange {
                sectors: start..start.saturating_add(length),
                volume,
            })
            .collect();
        ranges.sort_by_key(|r| r.sectors.start);
        Self { ranges }
    }

    /// Open one userspace volume per target.
    pub fn open(access: Access, permissions: u32, targets: &[Target]) -> Result<Self> {
        let mut parts: Vec<(u64, u64, Box<dyn Volume>)> = Vec::with_capacity(targets.len());
        for target in targets {
            match target.open_volume(access, permissions) {
                Ok(volume) => parts.push((target.start(), target.length(), volume)),
                Err(err) => {
                    warn!(
                        target_type = target.target_type(),
                        start = target.start(),
                        error = %err,
                        "failed to open target volume"
                    );
                    for (start, _, volume) in parts.iter_mut() {
                        if let Err(close_err) = volume.close() {
                            debug!(start = *start, error = %close_err, "close after failed open");
                        }
                    }
                    return Err(err);
                }
            }
        }
        debug!(targets = parts.len(), ?access, "opened combined volume");
        Ok(Self::new(parts))
    }

    /// Sectors addressed, up to the end of the last range.
    pub fn sectors(&self) -> u64 {
        self.ranges.iter().map(|r| r.sectors.end).max().unwrap_or(0)
    }

    pub fn target_count(&self) -> usize {
        self.ranges.len()
    }

    /// Walk the ranges covering `length` bytes at `offset`, calling `io`
    /// with each piece's buffer slice and target-relative offset.
    ///
    /// Lookups are done in sectors so tables reaching past `u64::MAX` bytes
    /// never wrap onto low offsets.
    fn walk<F>(&self, length: usize, offset: u64, mut io: F) -> Result<usize>
    where
        F: FnMut(&dyn Volume, Range<usize>, u64) -> Result<usize>,
    {
        if length == 0 {
            return Ok(0);
        }
        check_alignment(offset, length, SECTOR_SIZE)?;

        let mut done = 0usize;
        for range in &self.ranges {
            let cursor = offset / SECTOR_SIZE + (done as u64) / SECTOR_SIZE;
            if !range.sectors.contains(&cursor) {
                continue;
            }
            let available = (range.sectors.end - cursor).saturating_mul(SECTOR_SIZE);
            let piece = ((length - done) as u64).min(available) as usize;
            let at = (cursor - range.sectors.start)
                .checked_mul(SECTOR_SIZE)
                .ok_or(Error::OutOfRange {
                    offset: offset.saturating_add(done as u64),
                })?;
            let n = io(range.volume.as_ref(), done..done + piece, at)?;
            done += n;
            if n < piece || done == length {
                return Ok(done);
            }
        }
        Err(Error::OutOfRange {
            offset: offset.saturating_add(done as u64),
        })
    }
}

impl Volume for CombinedVolume {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.walk(buf.len(), offset, |volume, piece, at| {
            volume.read_at(&mut buf[piece], at)
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.walk(buf.len(), offset, |volume, piece, at| {
            volume.write_at(&buf[piece], at)
        })
    }

    /// Close every constituent volume, reporting all failures together.
    fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for range in &mut self.ranges {
            if let Err(err) = range.volume.close() {
                warn!(
                    start = range.sectors.start,
                    error = %err,
                    "failed to close target volume"
                );
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseFailed(failures))
        }
    }
}

impl fmt::Debug for CombinedVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ranges.iter().map(|r| &r.sectors))
            .finish()
    }
}
