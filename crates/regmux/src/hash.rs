use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use regmux_types::ServerEntry;

/// Sentinel returned by a hash probe that cannot determine the upstream
/// state cheaply. It never equals a stored content hash, so comparing
/// against it always reads as "changed" and forces a full fetch.
pub const CHANGED_SENTINEL: &str = "unknown";

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content hash of a normalized server list.
///
/// Hashes the canonical JSON serialization, so it depends only on the
/// normalized data, never on transport metadata or input formatting.
pub fn catalog_hash(servers: &[ServerEntry]) -> Result<String> {
    let bytes = serde_json::to_vec(servers).context("failed to serialize catalog for hashing")?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmux_types::ServerVersion;

    #[test]
    fn sha256_hex_matches_known_vector() {
        insta::assert_snapshot!(
            sha256_hex(b""),
            @"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        insta::assert_snapshot!(
            sha256_hex(b"abc"),
            @"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn catalog_hash_is_order_sensitive() {
        let a = ServerEntry::new("a");
        let b = ServerEntry::new("b");
        let h1 = catalog_hash(&[a.clone(), b.clone()]).expect("hash");
        let h2 = catalog_hash(&[b, a]).expect("hash");
        assert_ne!(h1, h2);
    }

    #[test]
    fn catalog_hash_is_stable_for_equal_input() {
        let mut e = ServerEntry::new("demo");
        e.versions = vec![ServerVersion::new("1.0.0")];
        let h1 = catalog_hash(&[e.clone()]).expect("hash");
        let h2 = catalog_hash(&[e]).expect("hash");
        assert_eq!(h1, h2);
    }

    #[test]
    fn changed_sentinel_never_looks_like_a_digest() {
        assert_ne!(CHANGED_SENTINEL, sha256_hex(b""));
        assert!(CHANGED_SENTINEL.len() < 64);
    }
}
