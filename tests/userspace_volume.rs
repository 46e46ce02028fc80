//! Userspace Volume Integration Tests
//!
//! Exercises the public data path against real files:
//! - Joined linear targets address their backing files back to back
//! - Zero and verity targets behave as placeholders
//! - Crypt data survives close and reopen, and only decrypts with its key

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;

use assert_matches::assert_matches;
use tempfile::TempDir;

use devmap::{
    open_userspace_volume, Access, CryptFlag, CryptKey, CryptTarget, Error, LinearTarget,
    TableFile, Target, VerityTarget, Volume, ZeroTarget, SECTOR_SIZE,
};

const SECTOR: usize = SECTOR_SIZE as usize;

/// Create a file of `sectors` zeroed sectors with `text` written at `at`.
fn backing_file(dir: &Path, name: &str, sectors: u64, text: &str, at: u64) -> std::path::PathBuf {
    let path = dir.join(name);
    let file = fs::File::create(&path).unwrap();
    file.set_len(sectors * SECTOR_SIZE).unwrap();
    file.write_all_at(text.as_bytes(), at).unwrap();
    path
}

fn sentinel(i: usize) -> String {
    format!("Hello, world {} !!!", i)
}

// =============================================================================
// Linear Tests
// =============================================================================

mod linear_tests {
    use super::*;

    /// Three 5-sector linear targets, each over its own backing file.
    fn joined_table(dir: &TempDir) -> Vec<Target> {
        (0..3)
            .map(|i| {
                let path = backing_file(dir.path(), &format!("backing{}", i), 5, &sentinel(i), 0);
                Target::from(LinearTarget::new(i as u64 * 5, 5, path, 0))
            })
            .collect()
    }

    #[test]
    fn test_joined_devices_read() {
        let dir = TempDir::new().unwrap();
        let table = joined_table(&dir);
        let mut volume = open_userspace_volume(Access::ReadOnly, 0, &table).unwrap();
        assert_eq!(volume.sectors(), 15);
        assert_eq!(volume.target_count(), 3);

        let mut data = vec![0u8; 15 * SECTOR];
        assert_eq!(volume.read_at(&mut data, 0).unwrap(), data.len());

        let mut expected = vec![0u8; 15 * SECTOR];
        for i in 0..3 {
            let text = sentinel(i);
            expected[i * 5 * SECTOR..i * 5 * SECTOR + text.len()].copy_from_slice(text.as_bytes());
        }
        assert_eq!(data, expected);
        volume.close().unwrap();
    }

    #[test]
    fn test_joined_devices_write_spans_boundary() {
        let dir = TempDir::new().unwrap();
        let table = joined_table(&dir);
        let mut volume = open_userspace_volume(Access::ReadWrite, 0, &table).unwrap();

        // last sector of the first file plus first sector of the second
        let payload = vec![0x77u8; 2 * SECTOR];
        assert_eq!(volume.write_at(&payload, 4 * SECTOR_SIZE).unwrap(), payload.len());
        volume.close().unwrap();

        let first = fs::read(dir.path().join("backing0")).unwrap();
        let second = fs::read(dir.path().join("backing1")).unwrap();
        assert!(first[4 * SECTOR..].iter().all(|&b| b == 0x77));
        assert!(second[..SECTOR].iter().all(|&b| b == 0x77));
        assert!(second[SECTOR..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_backend_offset_shifts_view() {
        let dir = TempDir::new().unwrap();
        let path = backing_file(dir.path(), "backing", 50, &sentinel(1), 5 * SECTOR_SIZE + 100);
        let table = vec![Target::from(LinearTarget::new(0, 45, path, 5 * SECTOR_SIZE))];
        let volume = open_userspace_volume(Access::ReadOnly, 0, &table).unwrap();

        let mut first = vec![0u8; SECTOR];
        volume.read_at(&mut first, 0).unwrap();
        assert_eq!(&first[100..100 + sentinel(1).len()], sentinel(1).as_bytes());
    }

    #[test]
    fn test_misaligned_and_out_of_range() {
        let dir = TempDir::new().unwrap();
        let table = joined_table(&dir);
        let volume = open_userspace_volume(Access::ReadOnly, 0, &table).unwrap();

        let mut buf = vec![0u8; SECTOR];
        assert_matches!(
            volume.read_at(&mut buf, 100),
            Err(Error::Misaligned { offset: 100, .. })
        );
        assert_matches!(
            volume.read_at(&mut buf[..100], 0),
            Err(Error::Misaligned { length: 100, .. })
        );
        assert_matches!(
            volume.read_at(&mut buf, 15 * SECTOR_SIZE),
            Err(Error::OutOfRange { .. })
        );
        assert_eq!(volume.read_at(&mut [], 0).unwrap(), 0);
    }

    #[test]
    fn test_create_access_makes_backing_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.img");
        let table = vec![Target::from(LinearTarget::new(0, 2, &path, 0))];

        let mut volume = open_userspace_volume(Access::Create, 0o640, &table).unwrap();
        volume.write_at(&[1u8; 1024], 0).unwrap();
        volume.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![1u8; 1024]);
    }

    #[test]
    fn test_use_after_close() {
        let dir = TempDir::new().unwrap();
        let table = joined_table(&dir);
        let mut volume = open_userspace_volume(Access::ReadOnly, 0, &table).unwrap();
        volume.close().unwrap();

        let mut buf = vec![0u8; SECTOR];
        assert_matches!(volume.read_at(&mut buf, 0), Err(Error::Closed));
    }
}

// =============================================================================
// Placeholder Target Tests
// =============================================================================

mod placeholder_tests {
    use super::*;

    #[test]
    fn test_zero_target_between_linear() {
        let dir = TempDir::new().unwrap();
        let a = backing_file(dir.path(), "a", 1, "AAAA", 0);
        let b = backing_file(dir.path(), "b", 1, "BBBB", 0);
        let table = vec![
            Target::from(LinearTarget::new(0, 1, a, 0)),
            Target::from(ZeroTarget::new(1, 2)),
            Target::from(LinearTarget::new(3, 1, b, 0)),
        ];
        let volume = open_userspace_volume(Access::ReadWrite, 0, &table).unwrap();

        // writes into the zero range vanish
        assert_eq!(volume.write_at(&[9u8; SECTOR], SECTOR_SIZE).unwrap(), SECTOR);

        let mut data = vec![0xffu8; 4 * SECTOR];
        assert_eq!(volume.read_at(&mut data, 0).unwrap(), data.len());
        assert_eq!(&data[..4], b"AAAA");
        assert!(data[SECTOR..3 * SECTOR].iter().all(|&b| b == 0));
        assert_eq!(&data[3 * SECTOR..3 * SECTOR + 4], b"BBBB");
    }

    #[test]
    fn test_verity_target_refuses_io() {
        let table = vec![Target::from(VerityTarget {
            start: 0,
            length: 8,
            hash_type: 1,
            data_device: "/dev/loop4".into(),
            hash_device: "/dev/loop5".into(),
            data_block_size: 4096,
            hash_block_size: 4096,
            num_data_blocks: 1,
            hash_start_block: 1,
            algorithm: "sha256".to_string(),
            digest: "00".repeat(32),
            salt: "-".to_string(),
            params: vec![],
        })];
        let mut volume = open_userspace_volume(Access::ReadOnly, 0, &table).unwrap();

        let mut buf = vec![0u8; SECTOR];
        assert!(volume.read_at(&mut buf, 0).unwrap_err().is_not_implemented());
        assert!(volume.write_at(&buf, 0).unwrap_err().is_not_implemented());
        assert_matches!(volume.close(), Err(Error::CloseFailed(errors)) if errors.len() == 1);
    }
}

// =============================================================================
// Crypt Tests
// =============================================================================

mod crypt_tests {
    use super::*;

    const KEY_HEX: &str = "babebabebabebabebabebabebabebabebabebabebabebabebabebabebabebabe";

    fn crypt_table(path: &Path, key: CryptKey) -> Vec<Target> {
        vec![Target::from(
            CryptTarget::new(0, 40, path, key).with_flags([CryptFlag::AllowDiscards]),
        )]
    }

    #[test]
    fn test_crypt_roundtrip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = backing_file(dir.path(), "crypt", 40, "", 0);
        let table = crypt_table(&path, CryptKey::from_hex(KEY_HEX).unwrap());

        let plaintext: Vec<u8> = sentinel(7).bytes().cycle().take(4 * SECTOR).collect();
        let mut volume = open_userspace_volume(Access::ReadWrite, 0, &table).unwrap();
        assert_eq!(volume.write_at(&plaintext, 8 * SECTOR_SIZE).unwrap(), plaintext.len());
        volume.close().unwrap();

        let raw = fs::read(&path).unwrap();
        assert_ne!(&raw[8 * SECTOR..12 * SECTOR], plaintext.as_slice());

        let mut volume = open_userspace_volume(Access::ReadOnly, 0, &table).unwrap();
        let mut out = vec![0u8; plaintext.len()];
        assert_eq!(volume.read_at(&mut out, 8 * SECTOR_SIZE).unwrap(), out.len());
        assert_eq!(out, plaintext);
        volume.close().unwrap();
    }

    #[test]
    fn test_crypt_wrong_key_yields_garbage() {
        let dir = TempDir::new().unwrap();
        let path = backing_file(dir.path(), "crypt", 40, "", 0);

        let plaintext = vec![0x33u8; SECTOR];
        let key = CryptKey::from_hex(KEY_HEX).unwrap();
        let volume =
            open_userspace_volume(Access::ReadWrite, 0, &crypt_table(&path, key)).unwrap();
        volume.write_at(&plaintext, 0).unwrap();
        drop(volume);

        let other = CryptKey::raw(vec![0xcdu8; 32]);
        let volume =
            open_userspace_volume(Access::ReadOnly, 0, &crypt_table(&path, other)).unwrap();
        let mut out = vec![0u8; SECTOR];
        volume.read_at(&mut out, 0).unwrap();
        assert_ne!(out, plaintext);
    }

    #[test]
    fn test_crypt_keyring_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = backing_file(dir.path(), "crypt", 40, "", 0);
        let table = crypt_table(&path, CryptKey::Keyring(":32:logon:foobarkey".to_string()));
        assert_matches!(
            open_userspace_volume(Access::ReadOnly, 0, &table),
            Err(Error::KeyringKeyUnsupported(id)) if id == ":32:logon:foobarkey"
        );
    }

    #[test]
    fn test_crypt_behind_linear_uses_relative_offsets() {
        let dir = TempDir::new().unwrap();
        let plain = backing_file(dir.path(), "plain", 4, &sentinel(0), 0);
        let crypt = backing_file(dir.path(), "crypt", 4, "", 0);
        let key = CryptKey::from_hex(KEY_HEX).unwrap();

        let table = vec![
            Target::from(LinearTarget::new(0, 4, plain, 0)),
            Target::from(CryptTarget::new(4, 4, &crypt, key.clone())),
        ];
        let volume = open_userspace_volume(Access::ReadWrite, 0, &table).unwrap();
        let sector = vec![0x44u8; SECTOR];
        volume.write_at(&sector, 4 * SECTOR_SIZE).unwrap();
        drop(volume);

        // the crypt target alone sees the same sector at its offset 0
        let alone = vec![Target::from(CryptTarget::new(0, 4, &crypt, key))];
        let volume = open_userspace_volume(Access::ReadOnly, 0, &alone).unwrap();
        let mut out = vec![0u8; SECTOR];
        volume.read_at(&mut out, 0).unwrap();
        assert_eq!(out, sector);
    }
}

// =============================================================================
// Table File Tests
// =============================================================================

mod table_file_tests {
    use super::*;

    #[test]
    fn test_table_file_drives_userspace_volume() {
        let dir = TempDir::new().unwrap();
        let backing = backing_file(dir.path(), "backing", 8, &sentinel(3), 0);
        let table_path = dir.path().join("table.yaml");
        fs::write(
            &table_path,
            format!(
                "name: filetest\nread_only: true\ntargets:\n  - type: linear\n    start: 0\n    length: 8\n    backend_device: {}\n",
                backing.display()
            ),
        )
        .unwrap();

        let table = TableFile::load(&table_path).unwrap();
        assert!(table.read_only);
        let volume = open_userspace_volume(Access::ReadOnly, 0, &table.targets).unwrap();
        let mut buf = vec![0u8; SECTOR];
        volume.read_at(&mut buf, 0).unwrap();
        assert!(buf.starts_with(sentinel(3).as_bytes()));
    }
}
