//! Content hashing used for file and package identities.

use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept when a hash is embedded in an identifier.
pub const IDENTITY_HEX_LEN: usize = 32;

/// A SHA-256 hash of an identity string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Hex prefix used inside file and package identifiers.
    pub fn identity_hex(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(IDENTITY_HEX_LEN);
        hex
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_hex_is_prefix_of_full_hash() {
        let hash = ContentHash::compute(b"https://example.com/a.pdf");
        let short = hash.identity_hex();
        assert_eq!(short.len(), IDENTITY_HEX_LEN);
        assert!(hash.to_hex().starts_with(&short));
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            ContentHash::compute(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
