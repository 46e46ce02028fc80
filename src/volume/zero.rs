use super::Volume;
use crate::error::Result;

/// Reads yield zeros, writes are accepted and discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroVolume;

impl Volume for ZeroVolume {
    fn read_at(&self, buf: &mut [u8], _offset: u64) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_at(&self, buf: &[u8], _offset: u64) -> Result<usize> {
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_volume() {
        let mut volume = ZeroVolume;
        let mut buf = [0xffu8; 1024];
        assert_eq!(volume.read_at(&mut buf, 4096).unwrap(), 1024);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(volume.write_at(&[1, 2, 3], 0).unwrap(), 3);
        volume.close().unwrap();
    }
}
