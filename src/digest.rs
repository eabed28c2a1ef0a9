//! SHA-256 digest of firmware images.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compare a computed digest with an advisory one from the manifest,
/// ignoring case and surrounding whitespace.
pub fn matches(computed: &str, advisory: &str) -> bool {
    computed.eq_ignore_ascii_case(advisory.trim())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn empty_buffer() {
    assert_eq!(
        digest(&[]),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn known_value() {
    assert_eq!(
        digest(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn deterministic() {
    let image = vec![0xa5u8; 40_000];
    assert_eq!(digest(&image), digest(&image.clone()));
}

#[test]
fn advisory_comparison_ignores_case() {
    let computed = digest(b"abc");
    assert!(matches(&computed, &computed.to_ascii_uppercase()));
    assert!(!matches(&computed, &digest(b"abd")));
}
