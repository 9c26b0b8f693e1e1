//! Content addressing for agent-vcs objects.
//!
//! Every stored object is identified by the SHA-256 digest of its canonical
//! byte encoding. The digest is fixed at 32 bytes and rendered as 64
//! lowercase hex characters at every API boundary; equality is byte
//! equality, so storing the same logical object twice yields the same key.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    /// The all-zero hash, used as the audit chain sentinel for the first
    /// entry and never produced by hashing real content.
    pub const ZERO: ObjectHash = ObjectHash([0u8; 32]);

    /// Create a hash from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the hash of a byte slice.
    pub fn compute(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Return the lowercase hex representation (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check whether a string is a well-formed lowercase hex hash.
    pub fn is_valid(s: &str) -> bool {
        s.len() == 64
            && s.chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    /// Verify that `content` hashes to this value.
    pub fn verify(&self, content: &[u8]) -> bool {
        Self::compute(content) == *self
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex())
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parse 64 lowercase hex chars into an `ObjectHash`.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(format!("Invalid SHA-256 hash format: {s}"));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; 32];
        h.copy_from_slice(&bytes);
        Ok(Self(h))
    }
}

impl Serialize for ObjectHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let h = ObjectHash::compute(b"hello");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<ObjectHash>().unwrap(), h);
    }

    #[test]
    fn hash_rejects_uppercase_and_short_input() {
        let h = ObjectHash::compute(b"hello").to_hex();
        assert!(h.to_uppercase().parse::<ObjectHash>().is_err());
        assert!("abc123".parse::<ObjectHash>().is_err());
    }

    #[test]
    fn hash_verify_detects_mutation() {
        let h = ObjectHash::compute(b"payload");
        assert!(h.verify(b"payload"));
        assert!(!h.verify(b"payloae"));
    }

    #[test]
    fn zero_sentinel_is_not_a_content_hash() {
        assert_ne!(ObjectHash::compute(b""), ObjectHash::ZERO);
        assert_eq!(ObjectHash::ZERO.to_hex(), "0".repeat(64));
    }
}
