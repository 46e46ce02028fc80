//! dm-crypt: transparent sector encryption.
//!
//! The kernel accepts the key either as hex-encoded bytes or as a reference
//! into the kernel keyring. Only the former can be used by the userspace
//! volume, since keyring keys are never readable from user space.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use super::SECTOR_SIZE;
use crate::error::Result;
use crate::volume::{Access, CryptVolume, Volume};

pub(crate) const TARGET_TYPE: &str = "crypt";

/// The only cipher specification the userspace volume implements.
pub const AES_XTS_PLAIN64: &str = "aes-xts-plain64";

// =============================================================================
// Key Material
// =============================================================================

/// Key passed to the crypt target.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptKey {
    /// Raw key bytes (hex in table files)
    Raw(#[serde(with = "hex_key")] Zeroizing<Vec<u8>>),
    /// Kernel keyring reference such as `:64:logon:vault-key`
    Keyring(String),
}

impl CryptKey {
    /// Wrap raw key bytes.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        CryptKey::Raw(Zeroizing::new(bytes.into()))
    }

    /// Parse a hex-encoded raw key.
    pub fn from_hex(hex_key: &str) -> std::result::Result<Self, hex::FromHexError> {
        hex::decode(hex_key).map(Self::raw)
    }

    /// Token placed in the kernel parameter line.
    fn spec_token(&self) -> String {
        match self {
            CryptKey::Raw(bytes) => hex::encode(bytes.as_slice()),
            CryptKey::Keyring(id) => id.clone(),
        }
    }
}

impl fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptKey::Raw(bytes) => write!(f, "Raw(<{} bytes redacted>)", bytes.len()),
            CryptKey::Keyring(id) => f.debug_tuple("Keyring").field(id).finish(),
        }
    }
}

mod hex_key {
    use super::*;

    pub fn serialize<S: Serializer>(
        key: &Zeroizing<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(key.as_slice()));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Zeroizing<Vec<u8>>, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        hex::decode(encoded.as_str())
            .map(Zeroizing::new)
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Optional Parameters
// =============================================================================

/// Named optional parameters of the crypt target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptFlag {
    AllowDiscards,
    SameCpuCrypt,
    SubmitFromCryptCpus,
    NoReadWorkqueue,
    NoWriteWorkqueue,
    /// IVs count in units of the crypt sector size instead of 512 bytes
    IvLargeSectors,
}

impl CryptFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptFlag::AllowDiscards => "allow_discards",
            CryptFlag::SameCpuCrypt => "same_cpu_crypt",
            CryptFlag::SubmitFromCryptCpus => "submit_from_crypt_cpus",
            CryptFlag::NoReadWorkqueue => "no_read_workqueue",
            CryptFlag::NoWriteWorkqueue => "no_write_workqueue",
            CryptFlag::IvLargeSectors => "iv_large_sectors",
        }
    }
}

impl fmt::Display for CryptFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Crypt Target
// =============================================================================

/// Encrypted mapping onto `backend_device`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptTarget {
    pub start: u64,
    pub length: u64,
    /// Device that stores the ciphertext
    pub backend_device: PathBuf,
    /// Byte offset of the ciphertext in the backend device
    #[serde(default)]
    pub backend_offset: u64,
    /// Kernel cipher specification
    #[serde(default = "default_cipher")]
    pub cipher: String,
    pub key: CryptKey,
    /// Constant added to every IV sector number
    #[serde(default)]
    pub iv_tweak: u64,
    #[serde(default)]
    pub flags: Vec<CryptFlag>,
    /// Encryption sector size in bytes; 0 means 512
    #[serde(default)]
    pub sector_size: u32,
}

fn default_cipher() -> String {
    AES_XTS_PLAIN64.to_string()
}

impl CryptTarget {
    /// Create an `aes-xts-plain64` target with no flags and 512-byte sectors.
    pub fn new(start: u64, length: u64, backend_device: impl Into<PathBuf>, key: CryptKey) -> Self {
        Self {
            start,
            length,
            backend_device: backend_device.into(),
            backend_offset: 0,
            cipher: default_cipher(),
            key,
            iv_tweak: 0,
            flags: Vec::new(),
            sector_size: 0,
        }
    }

    pub fn with_backend_offset(mut self, offset: u64) -> Self {
        self.backend_offset = offset;
        self
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = CryptFlag>) -> Self {
        self.flags = flags.into_iter().collect();
        self
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_iv_tweak(mut self, iv_tweak: u64) -> Self {
        self.iv_tweak = iv_tweak;
        self
    }

    /// Whether the IV counter advances per crypt sector rather than per 512 bytes.
    pub fn iv_large_sectors(&self) -> bool {
        self.flags.contains(&CryptFlag::IvLargeSectors)
    }

    pub(crate) fn build_spec(&self) -> String {
        let mut opt_params: Vec<String> = self.flags.iter().map(ToString::to_string).collect();
        if self.sector_size != 0 && u64::from(self.sector_size) != SECTOR_SIZE {
            opt_params.push(format!("sector_size:{}", self.sector_size));
        }

        let mut args = vec![
            self.cipher.clone(),
            self.key.spec_token(),
            self.iv_tweak.to_string(),
            self.backend_device.display().to_string(),
            (self.backend_offset / SECTOR_SIZE).to_string(),
            opt_params.len().to_string(),
        ];
        args.extend(opt_params);
        args.join(" ")
    }

    pub(crate) fn open_volume(&self, access: Access, permissions: u32) -> Result<Box<dyn Volume>> {
        Ok(Box::new(CryptVolume::open(self, access, permissions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "babebabebabebabebabebabebabebabebabebabebabebabebabebabebabebabe";

    fn target() -> CryptTarget {
        CryptTarget::new(0, 40, "/dev/loop0", CryptKey::from_hex(KEY_HEX).unwrap())
    }

    #[test]
    fn test_crypt_spec_hex_key() {
        let t = target().with_flags([CryptFlag::AllowDiscards]);
        assert_eq!(
            t.build_spec(),
            format!("aes-xts-plain64 {} 0 /dev/loop0 0 1 allow_discards", KEY_HEX)
        );
    }

    #[test]
    fn test_crypt_spec_keyring_verbatim() {
        let mut t = target();
        t.key = CryptKey::Keyring(":32:logon:foobarkey".to_string());
        assert_eq!(
            t.build_spec(),
            "aes-xts-plain64 :32:logon:foobarkey 0 /dev/loop0 0 0"
        );
    }

    #[test]
    fn test_crypt_spec_sector_size_counted_as_flag() {
        let t = target()
            .with_flags([CryptFlag::AllowDiscards, CryptFlag::NoReadWorkqueue])
            .with_sector_size(4096)
            .with_iv_tweak(7)
            .with_backend_offset(2048);
        assert_eq!(
            t.build_spec(),
            format!(
                "aes-xts-plain64 {} 7 /dev/loop0 4 3 allow_discards no_read_workqueue sector_size:4096",
                KEY_HEX
            )
        );
    }

    #[test]
    fn test_crypt_spec_default_sector_size_not_emitted() {
        let t = target().with_sector_size(512);
        assert!(t.build_spec().ends_with(" 0 0"));
    }

    #[test]
    fn test_crypt_key_debug_is_redacted() {
        let debug = format!("{:?}", target().key);
        assert_eq!(debug, "Raw(<32 bytes redacted>)");
        assert!(!debug.contains("babe"));
    }

    #[test]
    fn test_crypt_key_serde_roundtrip_through_hex() {
        let json = serde_json::to_string(&target().key).unwrap();
        assert_eq!(json, format!("{{\"raw\":\"{}\"}}", KEY_HEX));
        let key: CryptKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, target().key);
    }
}
