//! Property-Based Tests for Userspace Volumes
//!
//! # Test Properties
//!
//! 1. **Crypt Roundtrip**: read(write(data)) = data for any key size,
//!    sector size and aligned position
//! 2. **Crypt Confidentiality**: backing bytes never equal non-trivial plaintext
//! 3. **Combined Addressing**: reading through a combined linear volume
//!    equals reading the backing files in table order

#![cfg(test)]

use proptest::prelude::*;
use tempfile::NamedTempFile;

use super::{open_userspace_volume, Access, CryptVolume, Volume};
use crate::target::{CryptKey, CryptTarget, LinearTarget, Target, SECTOR_SIZE};

// =============================================================================
// Property Strategies
// =============================================================================

/// Keys for AES-128, AES-192 and AES-256 XTS.
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![Just(32usize), Just(48usize), Just(64usize)]
        .prop_flat_map(|len| prop::collection::vec(any::<u8>(), len))
}

/// Crypt sector sizes in bytes.
fn sector_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(512u32), Just(1024u32), Just(4096u32)]
}

fn backing_file(len: u64) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(len).unwrap();
    file
}

// =============================================================================
// Crypt Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: data written through a crypt volume reads back unchanged.
    #[test]
    fn prop_crypt_roundtrip(
        key in key_strategy(),
        sector_size in sector_size_strategy(),
        iv_tweak in 0u64..1_000_000,
        first_sector in 0u64..8,
        sectors in 1usize..8,
        seed in any::<u8>(),
    ) {
        let sector_bytes = sector_size as usize;
        let file = backing_file(16 * u64::from(sector_size));
        let target_sectors = 16 * u64::from(sector_size) / SECTOR_SIZE;
        let target = CryptTarget::new(0, target_sectors, file.path(), CryptKey::raw(key))
            .with_sector_size(sector_size)
            .with_iv_tweak(iv_tweak);
        let volume = CryptVolume::open(&target, Access::ReadWrite, 0)?;

        let data: Vec<u8> = (0..sectors * sector_bytes)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        let offset = first_sector * u64::from(sector_size);

        prop_assert_eq!(volume.write_at(&data, offset)?, data.len());
        let mut out = vec![0u8; data.len()];
        prop_assert_eq!(volume.read_at(&mut out, offset)?, data.len());
        prop_assert_eq!(out, data.clone());

        let raw = std::fs::read(file.path()).unwrap();
        let start = offset as usize;
        prop_assert_ne!(&raw[start..start + data.len()], data.as_slice());
    }

    /// Property: the same plaintext at different offsets yields different ciphertext.
    #[test]
    fn prop_crypt_position_dependent(
        key in key_strategy(),
        a in 0u64..16,
        b in 0u64..16,
    ) {
        prop_assume!(a != b);
        let file = backing_file(16 * SECTOR_SIZE);
        let target = CryptTarget::new(0, 16, file.path(), CryptKey::raw(key));
        let volume = CryptVolume::open(&target, Access::ReadWrite, 0)?;

        let sector = [0xa5u8; SECTOR_SIZE as usize];
        volume.write_at(&sector, a * SECTOR_SIZE)?;
        volume.write_at(&sector, b * SECTOR_SIZE)?;

        let raw = std::fs::read(file.path()).unwrap();
        let (a, b) = ((a * SECTOR_SIZE) as usize, (b * SECTOR_SIZE) as usize);
        prop_assert_ne!(&raw[a..a + 512], &raw[b..b + 512]);
    }
}

// =============================================================================
// Combined Volume Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: a combined linear volume reads the backing files back to back.
    #[test]
    fn prop_combined_matches_concatenation(
        lengths in prop::collection::vec(1u64..6, 1..4),
        read_start in 0u64..4,
        read_sectors in 1u64..8,
    ) {
        let mut files = Vec::new();
        let mut targets = Vec::new();
        let mut expected = Vec::new();
        let mut start = 0;
        for (i, &length) in lengths.iter().enumerate() {
            let content: Vec<u8> = (0..length * SECTOR_SIZE)
                .map(|b| (b as u8) ^ (i as u8 * 0x40))
                .collect();
            let file = NamedTempFile::new().unwrap();
            std::fs::write(file.path(), &content).unwrap();
            targets.push(Target::from(LinearTarget::new(start, length, file.path(), 0)));
            expected.extend_from_slice(&content);
            files.push(file);
            start += length;
        }

        let total = start;
        let read_start = read_start % total;
        let read_sectors = 1 + read_sectors % (total - read_start);

        let volume = open_userspace_volume(Access::ReadOnly, 0, &targets)?;
        let mut buf = vec![0u8; (read_sectors * SECTOR_SIZE) as usize];
        let offset = read_start * SECTOR_SIZE;
        prop_assert_eq!(volume.read_at(&mut buf, offset)?, buf.len());

        let from = offset as usize;
        prop_assert_eq!(&buf[..], &expected[from..from + buf.len()]);
    }
}
