//! AES-XTS sector cipher compatible with the kernel's `aes-xts-plain64`.
//!
//! The key is split in half: the first half encrypts data, the second
//! encrypts the tweak. The tweak is the 64-bit IV sector number in
//! little-endian order, zero-extended to 128 bits (`plain64`).

use std::fmt;

use aes::cipher::KeyInit;
use aes::{Aes128, Aes192, Aes256};
use xts_mode::{get_tweak_default, Xts128};

use crate::error::{Error, Result};
use crate::target::AES_XTS_PLAIN64;

pub(crate) enum SectorCipher {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

impl SectorCipher {
    /// Build the cipher for `cipher_spec`; the key length picks the AES variant.
    pub(crate) fn new(cipher_spec: &str, key: &[u8]) -> Result<Self> {
        if cipher_spec != AES_XTS_PLAIN64 {
            return Err(Error::UnsupportedCipher(cipher_spec.to_string()));
        }

        let invalid = |_| Error::InvalidKeyLength(key.len());
        let (data_key, tweak_key) = key.split_at(key.len() / 2);
        let cipher = match key.len() {
            32 => SectorCipher::Aes128(Xts128::new(
                Aes128::new_from_slice(data_key).map_err(invalid)?,
                Aes128::new_from_slice(tweak_key).map_err(invalid)?,
            )),
            48 => SectorCipher::Aes192(Xts128::new(
                Aes192::new_from_slice(data_key).map_err(invalid)?,
                Aes192::new_from_slice(tweak_key).map_err(invalid)?,
            )),
            64 => SectorCipher::Aes256(Xts128::new(
                Aes256::new_from_slice(data_key).map_err(invalid)?,
                Aes256::new_from_slice(tweak_key).map_err(invalid)?,
            )),
            n => return Err(Error::InvalidKeyLength(n)),
        };
        Ok(cipher)
    }

    pub(crate) fn key_bits(&self) -> u32 {
        match self {
            SectorCipher::Aes128(_) => 128,
            SectorCipher::Aes192(_) => 192,
            SectorCipher::Aes256(_) => 256,
        }
    }

    /// Encrypt one sector in place. `sector` must be at least 16 bytes.
    pub(crate) fn encrypt_sector(&self, sector: &mut [u8], iv_sector: u64) {
        let tweak = get_tweak_default(u128::from(iv_sector));
        match self {
            SectorCipher::Aes128(xts) => xts.encrypt_sector(sector, tweak),
            SectorCipher::Aes192(xts) => xts.encrypt_sector(sector, tweak),
            SectorCipher::Aes256(xts) => xts.encrypt_sector(sector, tweak),
        }
    }

    /// Decrypt one sector in place.
    pub(crate) fn decrypt_sector(&self, sector: &mut [u8], iv_sector: u64) {
        let tweak = get_tweak_default(u128::from(iv_sector));
        match self {
            SectorCipher::Aes128(xts) => xts.decrypt_sector(sector, tweak),
            SectorCipher::Aes192(xts) => xts.decrypt_sector(sector, tweak),
            SectorCipher::Aes256(xts) => xts.decrypt_sector(sector, tweak),
        }
    }
}

impl fmt::Debug for SectorCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorCipher")
            .field("key_bits", &self.key_bits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_ieee1619_vector_1() {
        let cipher = SectorCipher::new(AES_XTS_PLAIN64, &[0u8; 32]).unwrap();
        let mut block = [0u8; 32];
        cipher.encrypt_sector(&mut block, 0);
        assert_eq!(
            hex::encode(block),
            "917cf69ebd68b2ec9b9fe9a3eadda692cd43d2f59598ed858c02c2652fbf922e"
        );
        cipher.decrypt_sector(&mut block, 0);
        assert_eq!(block, [0u8; 32]);
    }

    #[test]
    fn test_key_length_selects_variant() {
        for (len, bits) in [(32, 128), (48, 192), (64, 256)] {
            let cipher = SectorCipher::new(AES_XTS_PLAIN64, &vec![1; len]).unwrap();
            assert_eq!(cipher.key_bits(), bits);
        }
        assert_matches!(
            SectorCipher::new(AES_XTS_PLAIN64, &[1; 20]),
            Err(Error::InvalidKeyLength(20))
        );
    }

    #[test]
    fn test_rejects_other_ciphers() {
        assert_matches!(
            SectorCipher::new("aes-cbc-essiv:sha256", &[0; 32]),
            Err(Error::UnsupportedCipher(c)) if c == "aes-cbc-essiv:sha256"
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let cipher = SectorCipher::new(AES_XTS_PLAIN64, &[0xab; 64]).unwrap();
        let text = format!("{:?}", cipher);
        assert_eq!(text, "SectorCipher { key_bits: 256, .. }");
    }

    #[test]
    fn test_tweak_changes_ciphertext() {
        let cipher = SectorCipher::new(AES_XTS_PLAIN64, &[9u8; 64]).unwrap();
        let mut a = [0x5au8; 512];
        let mut b = [0x5au8; 512];
        cipher.encrypt_sector(&mut a, 1);
        cipher.encrypt_sector(&mut b, 2);
        assert_ne!(a, b);
    }
}
