//! SHA-256 content hashing
//!
//! Every digest in the pipeline (raw segment hash, ciphertext hash, integrity
//! leaves and interior nodes, content addresses) goes through this module so
//! the algorithm is declared in exactly one place.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash a byte slice to a 32-byte SHA-256 digest
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental hasher for multi-part input
#[derive(Clone, Default)]
pub struct Hasher(Sha256);

impl Hasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    /// Feed more data into the hasher
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    /// Consume the hasher and return the digest
    pub fn finalize(self) -> Hash32 {
        Hash32(self.0.finalize().into())
    }
}

/// 32-byte digest with hex serialization
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// All-zero digest, used as the root of an empty tree
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    /// Hash bytes into a digest
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hash(data))
    }

    /// Borrow the raw digest
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Hash32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // SHA-256("abc")
        let digest = Hash32::from_bytes(b"abc");
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"hello").update(b" ").update(b"world");
        assert_eq!(h.finalize(), Hash32::from_bytes(b"hello world"));
    }

    #[test]
    fn test_hex_serde() {
        let digest = Hash32::from_bytes(b"segment");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));
        let back: Hash32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(Hash32::from_hex("zz").is_err());
        assert!(serde_json::from_str::<Hash32>("\"abcd\"").is_err());
    }
}
