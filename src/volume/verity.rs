use super::Volume;
use crate::error::{Error, Result};

/// Placeholder for verity targets. Hash-tree verification only happens in
/// the kernel, so every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerityVolume;

impl Volume for VerityVolume {
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Err(Error::NotImplemented("verity userspace read"))
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::NotImplemented("verity userspace write"))
    }

    fn close(&mut self) -> Result<()> {
        Err(Error::NotImplemented("verity userspace close"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verity_volume_refuses_everything() {
        let mut volume = VerityVolume;
        let mut buf = [0u8; 512];
        assert!(volume.read_at(&mut buf, 0).unwrap_err().is_not_implemented());
        assert!(volume.write_at(&buf, 0).unwrap_err().is_not_implemented());
        assert!(volume.close().unwrap_err().is_not_implemented());
    }
}
