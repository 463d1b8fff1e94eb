//! Property-based tests for skiff-updater.
//!
//! - Release signatures bind both the artifact bytes and the version
//! - The cache invalidation rule
//! - Feed file-name validation

use proptest::prelude::*;
use semver::Version;
use std::path::PathBuf;
use tempfile::TempDir;

use crate::cache::{needs_download, CachedDownload};
use crate::feed::{is_update_file_name_valid, UpdateInfo};
use crate::signature::{verify_signature, write_signature};

fn arb_version() -> impl Strategy<Value = Version> {
    (0u64..20, 0u64..20, 0u64..20)
        .prop_map(|(major, minor, patch)| Version::new(major, minor, patch))
}

fn arb_file_name() -> impl Strategy<Value = String> {
    "[a-z]{1,8}-[0-9]\\.[0-9]\\.[0-9]\\.(exe|zip)"
}

fn arb_artifact_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_release_signature_round_trip(
        content in arb_artifact_content(),
        version in arb_version()
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, &content).unwrap();
        let pair = skiff_crypto::generate_key_pair();

        write_signature(&path, &version.to_string(), &pair.private_key).unwrap();
        prop_assert!(verify_signature(&path, &version.to_string(), &pair.public_key).unwrap());
    }

    #[test]
    fn test_release_signature_rejects_other_version(
        content in arb_artifact_content(),
        signed in arb_version(),
        claimed in arb_version()
    ) {
        prop_assume!(signed != claimed);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, &content).unwrap();
        let pair = skiff_crypto::generate_key_pair();

        write_signature(&path, &signed.to_string(), &pair.private_key).unwrap();
        prop_assert!(!verify_signature(&path, &claimed.to_string(), &pair.public_key).unwrap());
    }

    #[test]
    fn test_release_signature_rejects_flipped_byte(
        content in prop::collection::vec(any::<u8>(), 1..4096),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, &content).unwrap();
        let pair = skiff_crypto::generate_key_pair();
        write_signature(&path, "1.0.0", &pair.private_key).unwrap();

        let mut tampered = content.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        std::fs::write(&path, &tampered).unwrap();

        prop_assert!(!verify_signature(&path, "1.0.0", &pair.public_key).unwrap());
    }

    #[test]
    fn test_cache_reused_only_for_same_or_older_release(
        cached_name in arb_file_name(),
        cached_version in arb_version(),
        offered_name in arb_file_name(),
        offered_version in arb_version()
    ) {
        let cached = CachedDownload::new(
            PathBuf::from("/cache").join(&cached_name),
            cached_name.clone(),
            cached_version.clone(),
        );
        let offered = UpdateInfo {
            file_name: offered_name.clone(),
            version: offered_version.clone(),
            size: 0,
        };

        let expected = offered_name != cached_name || offered_version > cached_version;
        prop_assert_eq!(needs_download(Some(&cached), &offered), expected);
        prop_assert!(needs_download(None, &offered));
    }

    #[test]
    fn test_file_names_with_separators_rejected(
        prefix in "[A-Za-z0-9.-]{0,8}",
        separator in "[/\\\\ :]",
        suffix in "[A-Za-z0-9.-]{0,8}"
    ) {
        let name = format!("{}{}{}", prefix, separator, suffix);
        prop_assert!(!is_update_file_name_valid(&name));
    }
}
